//! HTML rendering of a task's latest review.

use minijinja::{Environment, context};
use serde::Serialize;

const REVIEW_TEMPLATE_NAME: &str = "review.html";

const REVIEW_TEMPLATE: &str = r#"<!doctype html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <title>Review: {{ task_id }}</title>
  <style>
    body { font-family: sans-serif; margin: 2rem; }
    pre { font-family: monospace; margin: 0; }
    .addition { background: #e6ffed; }
    .removal { background: #ffeef0; }
    .context { color: #555; }
    .error { color: #b00020; }
  </style>
</head>
<body>
  <h1>Review for task {{ task_id }}</h1>
  {% if error %}
  <p class="error">{{ error }}</p>
  {% else %}
  <p>Status: {% if valid %}passed{% else %}rejected{% endif %}</p>
  {% if violations %}
  <h2>Violations</h2>
  <ul>
    {% for violation in violations %}<li>{{ violation }}</li>
    {% endfor %}
  </ul>
  {% endif %}
  <h2>Diff</h2>
  <div class="diff">
    {% for line in diff_lines %}<pre class="{{ line.kind }}">{{ line.content }}</pre>
    {% endfor %}
  </div>
  {% endif %}
</body>
</html>
"#;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffLine {
    pub kind: &'static str,
    pub content: String,
}

pub fn environment() -> anyhow::Result<Environment<'static>> {
    let mut env = Environment::new();
    env.add_template(REVIEW_TEMPLATE_NAME, REVIEW_TEMPLATE)?;
    Ok(env)
}

/// Split a unified diff into display lines. File headers count as context.
pub fn classify_lines(diff: &str) -> Vec<DiffLine> {
    diff.lines()
        .map(|line| {
            let kind = if line.starts_with("+++") || line.starts_with("---") {
                "context"
            } else if line.starts_with('+') {
                "addition"
            } else if line.starts_with('-') {
                "removal"
            } else {
                "context"
            };
            DiffLine {
                kind,
                content: line.to_string(),
            }
        })
        .collect()
}

pub fn render_review(
    env: &Environment<'_>,
    task_id: &str,
    diff: &str,
    valid: bool,
    violations: &[String],
) -> Result<String, minijinja::Error> {
    env.get_template(REVIEW_TEMPLATE_NAME)?.render(context! {
        task_id,
        valid,
        violations,
        diff_lines => classify_lines(diff),
    })
}

pub fn render_missing(
    env: &Environment<'_>,
    task_id: &str,
    message: &str,
) -> Result<String, minijinja::Error> {
    env.get_template(REVIEW_TEMPLATE_NAME)?.render(context! {
        task_id,
        error => message,
    })
}
