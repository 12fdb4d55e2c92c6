//! Message templates for the three cadence stages.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use crate::error::{CadenceError, Result};
use crate::models::{
    DeficitPattern, EmojiRating, ImageSpec, LessonObservation, RenderedContent, Stage,
    WeeklyReportWindow,
};

const MAX_HIGHLIGHTS: usize = 3;
const NOTE_EXCERPT_CHARS: usize = 160;

/// What a message is about.
#[derive(Debug, Clone, Copy)]
pub enum RenderSubject<'a> {
    Lesson(&'a LessonObservation),
    Week(&'a WeeklyReportWindow),
}

struct Template {
    title: &'static str,
    body: &'static str,
    required: &'static [&'static str],
}

const POST_LESSON: Template = Template {
    title: "Lesson update for {student_name}",
    body: "Hi! Here's a quick update on {student_name}'s lesson today.\n\
           {topic_line}\n\
           {encouragement}\n\
           {deficit_highlights}\n\
           {tutor_note}",
    required: &["student_name"],
};

const PROGRESS_CARD: Template = Template {
    title: "{student_name}'s progress card",
    body: "Progress card for {student_name}\n\
           Topics: {topics}\n\
           {encouragement}\n\
           {deficit_highlights}",
    required: &["student_name", "topics"],
};

pub fn encouragement(rating: EmojiRating) -> &'static str {
    match rating {
        EmojiRating::Good => "Great energy today, keep it up!",
        EmojiRating::Okay => "Steady progress today.",
        EmojiRating::Struggled => {
            "Today was a tough one, and sticking with it is what builds confidence."
        }
        EmojiRating::Unrated => "Thanks for another session together.",
    }
}

fn accent(rating: EmojiRating) -> &'static str {
    match rating {
        EmojiRating::Good => "#2f9e44",
        EmojiRating::Okay => "#1c7ed6",
        EmojiRating::Struggled => "#f08c00",
        EmojiRating::Unrated => "#868e96",
    }
}

/// Renders the content for `stage`. Deficits may include resolved patterns;
/// only open ones are highlighted, the first few in the order given.
pub fn render(
    stage: Stage,
    subject: RenderSubject<'_>,
    student_name: &str,
    deficits: &[DeficitPattern],
) -> Result<RenderedContent> {
    let open: Vec<&DeficitPattern> = deficits.iter().filter(|d| !d.resolved).collect();
    match (stage, subject) {
        (Stage::PostLesson, RenderSubject::Lesson(lesson)) => {
            render_post_lesson(lesson, student_name, &open)
        }
        (Stage::ProgressCard, RenderSubject::Lesson(lesson)) => {
            render_progress_card(lesson, student_name, &open)
        }
        (Stage::WeeklyReport, RenderSubject::Week(window)) => {
            render_weekly_report(window, student_name, &open)
        }
        (Stage::WeeklyReport, RenderSubject::Lesson(_)) => Err(CadenceError::Template {
            stage,
            placeholder: "week",
        }),
        (_, RenderSubject::Week(_)) => Err(CadenceError::Template {
            stage,
            placeholder: "lesson",
        }),
    }
}

fn render_post_lesson(
    lesson: &LessonObservation,
    student_name: &str,
    deficits: &[&DeficitPattern],
) -> Result<RenderedContent> {
    let mut bindings = base_bindings(student_name, lesson.rating, deficits);
    if !lesson.topics.is_empty() {
        bindings.insert(
            "topic_line",
            format!("Today we worked on {}.", join_list(&lesson.topics)),
        );
    }
    if !lesson.notes.is_empty() {
        bindings.insert("tutor_note", format!("Tutor note: {}", excerpt(&lesson.notes)));
    }

    let (title, body) = fill_template(Stage::PostLesson, &POST_LESSON, &bindings)?;
    Ok(RenderedContent {
        stage: Stage::PostLesson,
        title,
        body,
        image: None,
    })
}

fn render_progress_card(
    lesson: &LessonObservation,
    student_name: &str,
    deficits: &[&DeficitPattern],
) -> Result<RenderedContent> {
    let mut bindings = base_bindings(student_name, lesson.rating, deficits);
    if !lesson.topics.is_empty() {
        bindings.insert("topics", join_list(&lesson.topics));
    }

    let (title, body) = fill_template(Stage::ProgressCard, &PROGRESS_CARD, &bindings)?;
    let image = ImageSpec {
        template: Stage::ProgressCard.as_str().to_string(),
        width: 1080,
        height: 1080,
        headline: title.clone(),
        subtitle: join_list(&lesson.topics),
        badges: vec![lesson.rating.as_str().to_string()],
        highlights: highlight_lines(deficits),
        accent: accent(lesson.rating).to_string(),
    };
    Ok(RenderedContent {
        stage: Stage::ProgressCard,
        title,
        body,
        image: Some(image),
    })
}

fn render_weekly_report(
    window: &WeeklyReportWindow,
    student_name: &str,
    deficits: &[&DeficitPattern],
) -> Result<RenderedContent> {
    let stage = Stage::WeeklyReport;
    if student_name.trim().is_empty() {
        return Err(CadenceError::Template {
            stage,
            placeholder: "student_name",
        });
    }
    if window.lessons.is_empty() {
        return Err(CadenceError::Template {
            stage,
            placeholder: "lessons",
        });
    }

    let minutes: u64 = window
        .lessons
        .iter()
        .map(|l| u64::from(l.duration_minutes))
        .sum();
    let topics = summarize_topics(&window.lessons);
    let ratings = summarize_ratings(&window.lessons);

    let mut output = String::new();
    let _ = writeln!(output, "Weekly report for {student_name} ({})", window.week);
    let _ = writeln!(
        output,
        "{} this week, {} minutes together.",
        lesson_count(window.lessons.len()),
        minutes
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "Topics covered:");
    if topics.is_empty() {
        let _ = writeln!(output, "- General practice");
    } else {
        for (topic, count) in topics.iter() {
            let _ = writeln!(output, "- {topic} ({})", lesson_count(*count));
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "How the lessons felt:");
    for (rating, count) in ratings.iter() {
        let _ = writeln!(output, "- {}: {}", rating.as_str(), count);
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "Focus areas:");
    if deficits.is_empty() {
        let _ = writeln!(output, "No recurring difficulties this week.");
    } else {
        for line in highlight_lines(deficits) {
            let _ = writeln!(output, "- {line}");
        }
    }

    let highlights: Vec<String> = window
        .lessons
        .iter()
        .filter_map(|l| l.ai_extraction.as_ref())
        .flat_map(|x| x.key_observations.iter().cloned())
        .take(MAX_HIGHLIGHTS)
        .collect();
    if !highlights.is_empty() {
        let _ = writeln!(output);
        let _ = writeln!(output, "Tutor observations:");
        for observation in &highlights {
            let _ = writeln!(output, "- {observation}");
        }
    }

    let title = format!("{student_name}'s week in review");
    let image = ImageSpec {
        template: stage.as_str().to_string(),
        width: 1080,
        height: 1350,
        headline: title.clone(),
        subtitle: format!("{}, {} minutes", lesson_count(window.lessons.len()), minutes),
        badges: topics.iter().take(MAX_HIGHLIGHTS).map(|(t, _)| t.clone()).collect(),
        highlights: highlight_lines(deficits),
        accent: accent(dominant_rating(&ratings)).to_string(),
    };

    Ok(RenderedContent {
        stage,
        title,
        body: output.trim_end().to_string(),
        image: Some(image),
    })
}

fn base_bindings(
    student_name: &str,
    rating: EmojiRating,
    deficits: &[&DeficitPattern],
) -> HashMap<&'static str, String> {
    let mut bindings = HashMap::new();
    if !student_name.trim().is_empty() {
        bindings.insert("student_name", student_name.trim().to_string());
    }
    bindings.insert("encouragement", encouragement(rating).to_string());
    let highlights = highlight_lines(deficits);
    if !highlights.is_empty() {
        bindings.insert(
            "deficit_highlights",
            format!("Areas we're watching:\n- {}", highlights.join("\n- ")),
        );
    }
    bindings
}

/// Substitutes `{name}` placeholders. Missing required values fail; missing
/// optional values drop their line.
fn fill_template(
    stage: Stage,
    template: &Template,
    bindings: &HashMap<&'static str, String>,
) -> Result<(String, String)> {
    if let Some(missing) = template
        .required
        .iter()
        .find(|name| bindings.get(*name).map_or(true, |v| v.trim().is_empty()))
    {
        return Err(CadenceError::Template {
            stage,
            placeholder: *missing,
        });
    }
    let title = substitute(template.title, bindings);
    let body = substitute(template.body, bindings)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    Ok((title, body))
}

fn substitute(text: &str, bindings: &HashMap<&'static str, String>) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        output.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Some(value) = bindings.get(name) {
                    output.push_str(value);
                }
                rest = &after[end + 1..];
            }
            None => {
                output.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    output.push_str(rest);
    output
}

/// Keeps the caller's order; callers rank by focus score.
fn highlight_lines(deficits: &[&DeficitPattern]) -> Vec<String> {
    deficits
        .iter()
        .take(MAX_HIGHLIGHTS)
        .map(|d| format!("{}: {}", d.topic, d.suggested_action))
        .collect()
}

fn summarize_topics(lessons: &[LessonObservation]) -> Vec<(String, usize)> {
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for lesson in lessons {
        for topic in &lesson.topics {
            *counts.entry(topic.as_str()).or_insert(0) += 1;
        }
    }
    let mut topics: Vec<(String, usize)> = counts
        .into_iter()
        .map(|(topic, count)| (topic.to_string(), count))
        .collect();
    topics.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    topics
}

fn summarize_ratings(lessons: &[LessonObservation]) -> Vec<(EmojiRating, usize)> {
    [
        EmojiRating::Good,
        EmojiRating::Okay,
        EmojiRating::Struggled,
        EmojiRating::Unrated,
    ]
    .into_iter()
    .map(|rating| (rating, lessons.iter().filter(|l| l.rating == rating).count()))
    .filter(|(_, count)| *count > 0)
    .collect()
}

fn dominant_rating(ratings: &[(EmojiRating, usize)]) -> EmojiRating {
    ratings
        .iter()
        .max_by_key(|(_, count)| *count)
        .map(|(rating, _)| *rating)
        .unwrap_or(EmojiRating::Unrated)
}

fn lesson_count(n: usize) -> String {
    if n == 1 {
        "1 lesson".to_string()
    } else {
        format!("{n} lessons")
    }
}

fn join_list(items: &[String]) -> String {
    match items {
        [] => String::new(),
        [only] => only.clone(),
        [init @ .., last] => format!("{} and {}", init.join(", "), last),
    }
}

fn excerpt(notes: &str) -> String {
    if notes.chars().count() <= NOTE_EXCERPT_CHARS {
        return notes.to_string();
    }
    let cut: String = notes.chars().take(NOTE_EXCERPT_CHARS).collect();
    format!("{}...", cut.trim_end())
}
