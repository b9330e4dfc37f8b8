use std::collections::HashSet;

use serde::Serialize;

use crate::manifest::validate_run_name;
use crate::monitor::{requires_shell, resolve_program, split_command};
use crate::recipe::{Recipe, StepSpec};

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}

pub fn validate_recipe(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();

    if recipe.version != 1 {
        report
            .errors
            .push(format!("Unsupported pipeline version: {}", recipe.version));
    }

    if recipe.name.trim().is_empty() {
        report.errors.push("Pipeline name cannot be empty".into());
    } else if recipe.name.contains(['/', '\\']) {
        report
            .errors
            .push(format!("Pipeline name '{}' must not contain path separators", recipe.name));
    } else if let Err(err) = validate_run_name(&recipe.name) {
        report.errors.push(err.to_string());
    }

    if recipe.output_dir.as_os_str().is_empty() {
        report
            .errors
            .push("Output directory cannot be empty".into());
    }

    if recipe.steps.is_empty() {
        report
            .errors
            .push("Pipeline must contain at least one step".into());
    }

    let mut labels = HashSet::new();
    for (idx, spec) in recipe.steps.iter().enumerate() {
        report.merge(validate_step(idx, spec));
        if spec.capture_as.is_none() {
            let label = spec.to_step().resolved_label(&recipe.output_dir);
            if !labels.insert(label.clone()) {
                report.errors.push(format!(
                    "Step {} reuses label '{}'; labels key locks and checkpoints",
                    idx + 1,
                    label
                ));
            }
        }
    }

    if let Some(stop_after) = &recipe.settings.stop_after
        && !labels.contains(stop_after)
    {
        report.warnings.push(format!(
            "stop_after names '{stop_after}', which matches no step label"
        ));
    }

    report
}

fn validate_step(idx: usize, spec: &StepSpec) -> ValidationReport {
    let mut report = ValidationReport::default();
    let position = idx + 1;
    let commands = spec.command.to_vec();

    if commands.is_empty() {
        report
            .errors
            .push(format!("Step {position} has no commands"));
    }
    for command in &commands {
        if command.trim().is_empty() {
            report
                .errors
                .push(format!("Step {position} contains an empty command"));
        } else if spec.shell == Some(false)
            && let Err(err) = split_command(command)
        {
            report.errors.push(format!("Step {position}: {err}"));
        }
    }

    if let Some(key) = &spec.capture_as {
        if key.trim().is_empty() {
            report
                .errors
                .push(format!("Step {position} has an empty capture_as key"));
        }
        if commands.len() > 1 {
            report
                .errors
                .push(format!("Capture step {position} must have exactly one command"));
        }
        if !spec.target.is_empty() {
            report
                .errors
                .push(format!("Capture step {position} cannot declare targets"));
        }
    }

    if spec.target.is_empty() && spec.capture_as.is_none() && !spec.checkpoint {
        report.warnings.push(format!(
            "Step {position} has no target and will run on every invocation"
        ));
    }

    for pattern in &spec.cleanup {
        if let Err(err) = glob::Pattern::new(pattern) {
            report.errors.push(format!(
                "Step {position} cleanup pattern '{pattern}' is not a valid glob: {err}"
            ));
        }
    }

    report
}

/// Shell words that never name a program on `PATH`.
const SHELL_BUILTINS: &[&str] = &[
    "!", ".", ":", "[", "[[", "{", "(", "alias", "break", "case", "cd", "continue", "do",
    "done", "elif", "else", "esac", "eval", "exec", "exit", "export", "fi", "for", "function",
    "if", "local", "read", "return", "set", "shift", "source", "then", "trap", "ulimit",
    "umask", "unset", "until", "wait", "while",
];

/// Programs a command line would launch, as far as they can be told
/// without running a shell.
pub fn command_programs(command: &str, shell: Option<bool>) -> Vec<String> {
    if !shell.unwrap_or_else(|| requires_shell(command)) {
        return split_command(command)
            .map(|words| words.into_iter().take(1).collect())
            .unwrap_or_default();
    }
    let Some(segments) = shell_segments(command) else {
        return Vec::new();
    };
    segments
        .iter()
        .filter_map(|segment| segment_program(segment))
        .collect()
}

fn segment_program(segment: &str) -> Option<String> {
    let words = split_command(segment).ok()?;
    let mut words = words.into_iter();
    while let Some(word) = words.next() {
        let redirect = word.trim_start_matches(|c: char| c.is_ascii_digit());
        if redirect.starts_with(['>', '<']) {
            // `> file` takes the next word, `>file` does not.
            if redirect.trim_start_matches(['>', '<', '&']).is_empty() {
                words.next();
            }
            continue;
        }
        // Leading `VAR=value` assignments come before the program.
        if word.contains('=') && !word.starts_with('=') {
            if word.contains("$(") || word.contains('`') {
                return None;
            }
            continue;
        }
        if SHELL_BUILTINS.contains(&word.as_str())
            || word.starts_with(['$', '(', ')', '`', '-', '{', '}'])
        {
            return None;
        }
        return Some(word);
    }
    None
}

/// Split at unquoted `;`, `|`, `&` and newlines. `None` on unbalanced quotes.
fn shell_segments(command: &str) -> Option<Vec<String>> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut chars = command.chars();
    while let Some(ch) = chars.next() {
        match (quote, ch) {
            (Some(q), c) if c == q => {
                quote = None;
                current.push(c);
            }
            (Some('"'), '\\') | (None, '\\') => {
                current.push(ch);
                current.push(chars.next()?);
            }
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(ch);
                current.push(ch);
            }
            // `2>&1`, `<&3` and `&>file` are redirections.
            (None, '&') if current.ends_with(['>', '<']) || chars.as_str().starts_with('>') => {
                current.push(ch);
            }
            (None, ';' | '|' | '&' | '\n') => {
                if !current.trim().is_empty() {
                    segments.push(std::mem::take(&mut current));
                }
                current.clear();
            }
            (None, c) => current.push(c),
        }
    }
    if quote.is_some() {
        return None;
    }
    if !current.trim().is_empty() {
        segments.push(current);
    }
    Some(segments)
}

/// Every program named by the recipe that cannot be found, with the
/// 1-based position of its step. Each program is reported once.
pub fn uncallable_programs(recipe: &Recipe) -> Vec<(usize, String)> {
    let mut seen = HashSet::new();
    let mut missing = Vec::new();
    for (idx, spec) in recipe.steps.iter().enumerate() {
        for command in spec.command.to_vec() {
            for program in command_programs(&command, spec.shell) {
                if seen.insert(program.clone()) && resolve_program(&program).is_none() {
                    missing.push((idx + 1, program));
                }
            }
        }
    }
    missing
}

/// Pre-flight check that every command of the recipe can be launched.
pub fn check_commands(recipe: &Recipe) -> ValidationReport {
    let mut report = ValidationReport::default();
    for (position, program) in uncallable_programs(recipe) {
        report.errors.push(format!(
            "Step {position} calls '{program}', which is not an executable on PATH"
        ));
    }
    report
}
