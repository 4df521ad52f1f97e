use crate::executor::ToolCommand;
use crate::session::{AnalysisNotes, EditPlan};

use super::parse::{INPUT_PLACEHOLDER, OUTPUT_PLACEHOLDER};

pub(crate) fn analyze(instruction: &str) -> String {
    format!(
        "Analyze this image for editing. The user wants to: \"{instruction}\"\n\
\n\
Describe the subject, lighting, colors and composition, name the regions or \
elements that must change to satisfy the request, and list concrete technical \
adjustments with approximate values.\n\
\n\
Respond in EXACTLY this format, one field per line:\n\
DESCRIPTION: <short description>\n\
FOCUS: <comma-separated areas>\n\
ADJUSTMENTS: <comma-separated adjustments>\n\
NOTES: <quality, resolution or other observations>"
    )
}

pub(crate) const PLANNER_SYSTEM: &str = "You are an expert image editing planner. \
Decompose the user's request into specific, technical image editing operations.

Respond with a single JSON object:
{\"understanding\": \"<one sentence>\", \"steps\": [{\"operation\": \"<name>\", \"description\": \"<what and why>\", \"params\": {...}}]}

Available operations: brightness_adjust, contrast_adjust, saturation_adjust, \
color_temperature, color_grade, vignette, blur, sharpen, grayscale, sepia, crop, \
resize, rotate, flip, noise_reduction, exposure_adjust.
Use params such as \"direction\" (increase/decrease, warm/cool), \"amount\" \
(slight/moderate/strong) and explicit numbers where they matter.
Always return at least one step. Respond with JSON only.";

pub(crate) fn plan_request(instruction: &str, analysis: &AnalysisNotes) -> String {
    let mut text = format!("Plan the edits for this instruction: {instruction}\n\nImage analysis:\n");
    text.push_str(&format!("- description: {}\n", analysis.description));
    if !analysis.focus_areas.is_empty() {
        text.push_str(&format!("- focus: {}\n", analysis.focus_areas.join(", ")));
    }
    if !analysis.suggested_adjustments.is_empty() {
        text.push_str(&format!(
            "- suggested: {}\n",
            analysis.suggested_adjustments.join(", ")
        ));
    }
    if !analysis.technical_notes.is_empty() {
        text.push_str(&format!("- notes: {}\n", analysis.technical_notes));
    }
    text
}

pub(crate) fn replan(feedback: &str) -> String {
    format!(
        "The previous plan did not achieve the desired result. Reviewer feedback: {feedback}\n\
Create an improved plan."
    )
}

pub(crate) fn generator_system(tool: &str) -> String {
    format!(
        "You are an expert in the `{tool}` command-line image tool. Produce the exact \
argument list that applies the requested edits.

RULES:
1. Respond with JSON only: {{\"args\": [\"-y\", \"-i\", \"{INPUT_PLACEHOLDER}\", ..., \"{OUTPUT_PLACEHOLDER}\"]}}
2. Each argument is its own array element. Do not quote or escape anything.
3. Use {INPUT_PLACEHOLDER} and {OUTPUT_PLACEHOLDER} as standalone elements for the image paths.
4. Do not include the program name.
5. Chain multiple filters with commas inside a single -vf value.

FILTER REFERENCE (ffmpeg):
- Brightness: eq=brightness=X (-1.0..1.0; slight 0.1, moderate 0.2, strong 0.3)
- Contrast: eq=contrast=X (0..2, default 1; slight 1.1, moderate 1.3, strong 1.5)
- Saturation: eq=saturation=X (0..3, default 1; slight 1.2, moderate 1.5)
- Warm: colorbalance=rs=0.1:gs=0.05:bs=-0.1  Cool: colorbalance=rs=-0.1:gs=0:bs=0.1
- Vignette: vignette=PI/4
- Blur: gblur=sigma=X (slight 2, moderate 5, strong 10)
- Sharpen: unsharp=5:5:X:5:5:0 (slight 0.5, moderate 1.0, strong 1.5)
- Grayscale: format=gray
- Sepia: colorchannelmixer=.393:.769:.189:0:.349:.686:.168:0:.272:.534:.131
- Crop: crop=w:h:x:y  Scale: scale=W:H (-1 keeps aspect)  Rotate: rotate=X*PI/180  Flip: hflip / vflip"
    )
}

pub(crate) fn generate_request(plan: &EditPlan) -> String {
    let steps = plan
        .steps
        .iter()
        .map(|s| {
            let params = serde_json::to_string(&s.params).unwrap_or_default();
            format!("- {}: {params}", s.operation)
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!("Generate the arguments for these edit steps:\n{steps}")
}

/// Echo of the previous attempt, placeholders restored so the model sees
/// its own output format.
pub(crate) fn previous_args(command: &ToolCommand, input: &str, output: &str) -> String {
    let args = command
        .args
        .iter()
        .map(|a| {
            if a == input {
                INPUT_PLACEHOLDER.to_string()
            } else if a == output {
                OUTPUT_PLACEHOLDER.to_string()
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>();
    serde_json::json!({ "args": args }).to_string()
}

pub(crate) fn repair(stderr: &str) -> String {
    format!("That command failed with this error output:\n{stderr}\nFix the arguments.")
}

pub(crate) fn verify(instruction: &str, plan: &EditPlan) -> String {
    format!(
        "Analyze this edited image. The user requested: \"{instruction}\"\n\
The following edits were applied: {}\n\
\n\
Determine whether the edits are visible and match the request.\n\
\n\
Respond in EXACTLY this format:\n\
VERIFIED: yes or no\n\
CONFIDENCE: high, medium, or low\n\
FEEDBACK: <brief explanation of what you observe>",
        plan.operations()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::EditStep;

    #[test]
    fn previous_args_restores_placeholders() {
        let cmd = ToolCommand::new("ffmpeg", ["-i", "/a.jpg", "-vf", "hue=s=0", "/o.jpg"], "/o.jpg");
        let echoed = previous_args(&cmd, "/a.jpg", "/o.jpg");
        assert_eq!(
            echoed,
            r#"{"args":["-i","INPUT_PATH","-vf","hue=s=0","OUTPUT_PATH"]}"#
        );
    }

    #[test]
    fn generate_request_lists_params() {
        let plan = EditPlan::new(vec![
            EditStep::new("contrast_adjust", "").with_param("amount", "strong".into())
        ]);
        assert_eq!(
            generate_request(&plan),
            "Generate the arguments for these edit steps:\n- contrast_adjust: {\"amount\":\"strong\"}"
        );
    }
}
