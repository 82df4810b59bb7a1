use std::ops::Range;

pub type Span = Range<usize>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub message: String,
    pub span: Span,
}

impl Diagnostic {
    pub fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span,
        }
    }
}

/// 1-based line and byte column of `offset`.
pub fn line_col(src: &str, offset: usize) -> (usize, usize) {
    let offset = offset.min(src.len());
    let before = &src.as_bytes()[..offset];
    let line = before.iter().filter(|b| **b == b'\n').count() + 1;
    let line_start = before
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|p| p + 1)
        .unwrap_or(0);
    (line, offset - line_start + 1)
}

fn render_one(src: &str, diag: &Diagnostic) -> String {
    let (line, col) = line_col(src, diag.span.start);
    let text = src.lines().nth(line - 1).unwrap_or("");
    let width = diag
        .span
        .end
        .saturating_sub(diag.span.start)
        .max(1)
        .min(text.len().saturating_sub(col - 1).max(1));

    format!(
        "{line}:{col}: error: {}\n    | {text}\n    | {}{}",
        diag.message,
        " ".repeat(col - 1),
        "^".repeat(width)
    )
}

/// Render diagnostics as `line:col: error: message` blocks with carets.
pub fn render(src: &str, diags: &[Diagnostic]) -> String {
    diags
        .iter()
        .map(|d| render_one(src, d))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locates_offsets() {
        let src = "ab\ncde\nf";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 4), (2, 2));
        assert_eq!(line_col(src, 7), (3, 1));
    }

    #[test]
    fn renders_caret_under_span() {
        let src = "let x = 1;\nlet y = ?;";
        let out = render(src, &[Diagnostic::new("unexpected character `?`", 19..20)]);
        assert_eq!(
            out,
            "2:9: error: unexpected character `?`\n    | let y = ?;\n    |         ^"
        );
    }
}
