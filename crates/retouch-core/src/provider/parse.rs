//! Parsers turning raw model text into typed stage outputs.

use std::path::Path;

use serde::Deserialize;

use super::InferenceError;
use crate::executor::ToolCommand;
use crate::session::{AnalysisNotes, Confidence, EditPlan, EditStep, VerificationResult};

/// Placeholder the generator uses for the source image argument.
pub const INPUT_PLACEHOLDER: &str = "INPUT_PATH";
/// Placeholder the generator uses for the result image argument.
pub const OUTPUT_PLACEHOLDER: &str = "OUTPUT_PATH";

const DESCRIPTION_FALLBACK_CHARS: usize = 200;

/// Remove a surrounding markdown code fence, if any.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string (e.g. "json") on the opening fence line.
    let body = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Slice from the first `{` to the last `}`; models like to add prose.
fn json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn field<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (head, tail) = line.split_once(':')?;
    let head = head.trim().trim_matches('*').trim();
    head.eq_ignore_ascii_case(key).then(|| tail.trim())
}

fn comma_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `DESCRIPTION:` / `FOCUS:` / `ADJUSTMENTS:` / `NOTES:` lines.
///
/// Unrecognised text is tolerated: the description falls back to the start
/// of the response so later stages still get some context.
pub fn parse_analysis(text: &str) -> AnalysisNotes {
    let mut notes = AnalysisNotes::default();

    for line in text.lines() {
        let line = line.trim();
        if let Some(v) = field(line, "DESCRIPTION") {
            notes.description = v.to_string();
        } else if let Some(v) = field(line, "FOCUS") {
            notes.focus_areas = comma_list(v);
        } else if let Some(v) = field(line, "ADJUSTMENTS") {
            notes.suggested_adjustments = comma_list(v);
        } else if let Some(v) = field(line, "NOTES") {
            notes.technical_notes = v.to_string();
        }
    }

    if notes.description.is_empty() {
        notes.description = text
            .trim()
            .chars()
            .take(DESCRIPTION_FALLBACK_CHARS)
            .collect();
    }
    notes
}

#[derive(Debug, Deserialize)]
struct PlanPayload {
    #[serde(default)]
    understanding: Option<String>,
    #[serde(default, alias = "edit_steps")]
    steps: Vec<EditStep>,
}

/// Parse the planner's JSON into a non-empty [`EditPlan`].
pub fn parse_plan(text: &str) -> Result<EditPlan, InferenceError> {
    let body = strip_fences(text);
    let json = json_object(body)
        .ok_or_else(|| InferenceError::MalformedResponse("plan is not a JSON object".into()))?;

    let payload: PlanPayload = serde_json::from_str(json)
        .map_err(|e| InferenceError::MalformedResponse(format!("invalid plan JSON: {e}")))?;

    let steps: Vec<EditStep> = payload
        .steps
        .into_iter()
        .filter(|s| !s.operation.trim().is_empty())
        .collect();

    if steps.is_empty() {
        return Err(InferenceError::EmptyPlan);
    }

    Ok(EditPlan {
        understanding: payload.understanding.filter(|u| !u.trim().is_empty()),
        steps,
    })
}

#[derive(Debug, Deserialize)]
struct CommandPayload {
    args: Vec<String>,
}

/// Parse `{"args": [...]}` into a [`ToolCommand`] for `tool`.
///
/// Placeholders are swapped for the real paths only when they are a whole
/// argument, so paths never get spliced into filter expressions.
pub fn parse_command(
    text: &str,
    tool: &str,
    input: &Path,
    output: &Path,
) -> Result<ToolCommand, InferenceError> {
    let body = strip_fences(text);
    let json = json_object(body)
        .ok_or_else(|| InferenceError::MalformedResponse("command is not a JSON object".into()))?;

    let payload: CommandPayload = serde_json::from_str(json)
        .map_err(|e| InferenceError::MalformedResponse(format!("invalid command JSON: {e}")))?;

    let mut args = payload.args;
    if args.first().is_some_and(|a| a == tool) {
        args.remove(0);
    }
    if args.is_empty() {
        return Err(InferenceError::EmptyCommand);
    }
    if !args.iter().any(|a| a == OUTPUT_PLACEHOLDER) {
        return Err(InferenceError::MalformedResponse(format!(
            "command does not write to {OUTPUT_PLACEHOLDER}"
        )));
    }

    let input = input.to_string_lossy();
    let output_str = output.to_string_lossy();
    let args = args
        .into_iter()
        .map(|a| match a.as_str() {
            INPUT_PLACEHOLDER => input.to_string(),
            OUTPUT_PLACEHOLDER => output_str.to_string(),
            _ => a,
        })
        .collect::<Vec<_>>();

    Ok(ToolCommand::new(tool, args, output))
}

/// Parse `VERIFIED:` / `CONFIDENCE:` / `FEEDBACK:` lines.
///
/// Anything not clearly a "yes" counts as not verified.
pub fn parse_verification(text: &str) -> VerificationResult {
    let mut verified = false;
    let mut confidence = Confidence::Low;
    let mut feedback: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if let Some(v) = field(line, "VERIFIED") {
            verified = v.to_ascii_lowercase().starts_with("yes");
        } else if let Some(v) = field(line, "CONFIDENCE") {
            let v = v.to_ascii_lowercase();
            confidence = if v.contains("high") {
                Confidence::High
            } else if v.contains("medium") {
                Confidence::Medium
            } else {
                Confidence::Low
            };
        } else if let Some(v) = field(line, "FEEDBACK") {
            feedback = Some(v.to_string());
        }
    }

    VerificationResult {
        verified,
        confidence,
        feedback: feedback.unwrap_or_else(|| text.trim().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn strip_fences_handles_language_tag() {
        assert_eq!(strip_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_fences("  {\"a\":1}  "), "{\"a\":1}");
        assert_eq!(strip_fences("```\n{}\n```\n"), "{}");
    }

    #[test]
    fn analysis_lines_are_parsed() {
        let notes = parse_analysis(
            "DESCRIPTION: A cat on a sofa, warm light\n\
             FOCUS: cat, background\n\
             ADJUSTMENTS: desaturate fully, contrast +30%\n\
             NOTES: slight noise in shadows",
        );
        assert_eq!(notes.description, "A cat on a sofa, warm light");
        assert_eq!(notes.focus_areas, vec!["cat", "background"]);
        assert_eq!(notes.suggested_adjustments.len(), 2);
        assert_eq!(notes.technical_notes, "slight noise in shadows");
    }

    #[test]
    fn analysis_falls_back_to_leading_text() {
        let long = "x".repeat(500);
        let notes = parse_analysis(&long);
        assert_eq!(notes.description.len(), DESCRIPTION_FALLBACK_CHARS);
        assert!(notes.focus_areas.is_empty());
    }

    #[test]
    fn plan_parses_fenced_json_with_prose() {
        let text = "Here you go:\n```json\n{\"understanding\": \"B&W, punchy\", \"steps\": [\
            {\"operation\": \"grayscale\", \"description\": \"drop color\"},\
            {\"operation\": \"contrast_adjust\", \"params\": {\"amount\": \"strong\"}}]}\n```";
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.understanding.as_deref(), Some("B&W, punchy"));
        assert_eq!(plan.operations(), "grayscale, contrast_adjust");
        assert_eq!(plan.steps[1].params["amount"], "strong");
    }

    #[test]
    fn plan_accepts_edit_steps_alias() {
        let plan = parse_plan(r#"{"edit_steps": [{"operation": "sepia"}]}"#).unwrap();
        assert_eq!(plan.steps.len(), 1);
    }

    #[test]
    fn empty_plan_is_an_error() {
        assert!(matches!(
            parse_plan(r#"{"understanding": "nothing to do", "steps": []}"#),
            Err(InferenceError::EmptyPlan)
        ));
        assert!(matches!(
            parse_plan(r#"{"steps": [{"operation": "  "}]}"#),
            Err(InferenceError::EmptyPlan)
        ));
    }

    #[test]
    fn non_json_plan_is_malformed() {
        assert!(matches!(
            parse_plan("I would increase the contrast."),
            Err(InferenceError::MalformedResponse(_))
        ));
    }

    #[test]
    fn command_placeholders_become_whole_args() {
        let input = PathBuf::from("/photos/my cat.jpg");
        let output = PathBuf::from("/out/edited_1234abcd.jpg");
        let text = r#"{"args": ["ffmpeg", "-y", "-i", "INPUT_PATH", "-vf", "format=gray,eq=contrast=1.5", "OUTPUT_PATH"]}"#;

        let cmd = parse_command(text, "ffmpeg", &input, &output).unwrap();
        assert_eq!(cmd.program, "ffmpeg");
        assert_eq!(
            cmd.args,
            vec![
                "-y",
                "-i",
                "/photos/my cat.jpg",
                "-vf",
                "format=gray,eq=contrast=1.5",
                "/out/edited_1234abcd.jpg"
            ]
        );
        assert_eq!(cmd.output, output);
    }

    #[test]
    fn command_text_inside_args_is_not_expanded() {
        let text = r#"{"args": ["-i", "INPUT_PATH", "-metadata", "title=INPUT_PATH; rm -rf /", "OUTPUT_PATH"]}"#;
        let cmd = parse_command(text, "ffmpeg", Path::new("a.jpg"), Path::new("b.jpg")).unwrap();
        assert_eq!(cmd.args[3], "title=INPUT_PATH; rm -rf /");
    }

    #[test]
    fn command_without_output_is_malformed() {
        let text = r#"{"args": ["-i", "INPUT_PATH", "-f", "null", "-"]}"#;
        assert!(matches!(
            parse_command(text, "ffmpeg", Path::new("a.jpg"), Path::new("b.jpg")),
            Err(InferenceError::MalformedResponse(_))
        ));
    }

    #[test]
    fn empty_command_is_an_error() {
        assert!(matches!(
            parse_command(r#"{"args": ["ffmpeg"]}"#, "ffmpeg", Path::new("a"), Path::new("b")),
            Err(InferenceError::EmptyCommand)
        ));
    }

    #[test]
    fn raw_shell_string_is_malformed() {
        assert!(matches!(
            parse_command(
                "ffmpeg -y -i INPUT_PATH OUTPUT_PATH",
                "ffmpeg",
                Path::new("a"),
                Path::new("b")
            ),
            Err(InferenceError::MalformedResponse(_))
        ));
    }

    #[test]
    fn verification_yes_high() {
        let v = parse_verification(
            "VERIFIED: yes\nCONFIDENCE: high\nFEEDBACK: Image is grayscale with strong contrast.",
        );
        assert!(v.verified);
        assert_eq!(v.confidence, Confidence::High);
        assert_eq!(v.feedback, "Image is grayscale with strong contrast.");
    }

    #[test]
    fn verification_no_keeps_feedback() {
        let v = parse_verification("**VERIFIED**: no\nCONFIDENCE: medium\nFEEDBACK: still in color");
        assert!(!v.verified);
        assert_eq!(v.confidence, Confidence::Medium);
        assert_eq!(v.feedback, "still in color");
    }

    #[test]
    fn unstructured_verification_is_not_verified() {
        let v = parse_verification("Looks great to me!");
        assert!(!v.verified);
        assert_eq!(v.confidence, Confidence::Low);
        assert_eq!(v.feedback, "Looks great to me!");
    }
}
