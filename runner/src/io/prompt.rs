//! Brief rendering for collaborator input.

use anyhow::Result;
use minijinja::{Environment, context};
use serde::Serialize;

use crate::core::types::{AlgorithmSpec, ExitStatus};
use crate::io::collaborator::RepairRequest;

const GENERATE_TEMPLATE: &str = include_str!("prompts/generate.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");

/// Project file prepared for the repair brief.
#[derive(Debug, Clone, Serialize)]
struct NumberedFile {
    path: String,
    numbered: String,
}

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("generate", GENERATE_TEMPLATE)
            .expect("generate template should be valid");
        env.add_template("repair", REPAIR_TEMPLATE)
            .expect("repair template should be valid");
        Self { env }
    }

    fn render_generate(&self, spec: &AlgorithmSpec) -> Result<String> {
        let template = self.env.get_template("generate")?;
        Ok(template.render(context! { spec => spec })?)
    }

    fn render_repair(&self, request: &RepairRequest<'_>) -> Result<String> {
        let files: Vec<NumberedFile> = request
            .project
            .files
            .iter()
            .map(|(path, content)| NumberedFile {
                path: path.clone(),
                numbered: number_lines(content),
            })
            .collect();
        let result = request.result;
        let exit_code = match &result.status {
            ExitStatus::NonZeroExit { code } => *code,
            ExitStatus::Success
            | ExitStatus::Timeout
            | ExitStatus::InfrastructureFailure { .. }
            | ExitStatus::Cancelled => None,
        };

        let template = self.env.get_template("repair")?;
        let rendered = template.render(context! {
            spec_name => &request.spec.name,
            steps => &request.spec.steps,
            attempt => request.attempt,
            revision => request.project.revision,
            entrypoint => &request.project.entrypoint,
            status => result.status.as_str(),
            exit_code => exit_code,
            error => &result.classification,
            stderr => result.stderr.trim_end(),
            stdout => (!result.stdout.trim().is_empty()).then(|| result.stdout.trim_end()),
            feedback => request.feedback.map(str::trim).filter(|s| !s.is_empty()),
            files => files,
            requirements => &request.project.requirements,
        })?;
        Ok(rendered)
    }
}

/// Render the brief handed to the generation collaborator.
pub fn generate_brief(spec: &AlgorithmSpec) -> Result<String> {
    PromptEngine::new().render_generate(spec)
}

/// Render the brief handed to the repair collaborator.
pub fn repair_brief(request: &RepairRequest<'_>) -> Result<String> {
    PromptEngine::new().render_repair(request)
}

/// Prefix each line with its 1-based number, right-aligned to four columns.
pub fn number_lines(content: &str) -> String {
    let mut out = String::with_capacity(content.len() + content.len() / 8);
    for (idx, line) in content.lines().enumerate() {
        out.push_str(&format!("{:>4} | {}\n", idx + 1, line));
    }
    out
}
