use std::fmt;

use logos::Logos;

use super::diagnostics::{Diagnostic, Span};

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    #[token("kernel")]
    Kernel,
    #[token("let")]
    Let,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("for")]
    For,
    #[token("in")]
    In,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("buffer")]
    Buffer,

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
    #[regex(r"[0-9]+\.[0-9]+([eE][+-]?[0-9]+)?", |lex| lex.slice().parse::<f32>().ok())]
    Float(f32),
    #[regex(r"[0-9]+u", |lex| lex.slice().trim_end_matches('u').parse::<u32>().ok())]
    UInt(u32),
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    Int(i64),

    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token("..")]
    DotDot,
    #[token("=")]
    Assign,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<")]
    Lt,
    #[token("<=")]
    Le,
    #[token(">")]
    Gt,
    #[token(">=")]
    Ge,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    Slash,
    #[token("%")]
    Percent,
    #[token("&&")]
    AndAnd,
    #[token("||")]
    OrOr,
    #[token("!")]
    Bang,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier `{name}`"),
            Token::Float(v) => write!(f, "float `{v}`"),
            Token::UInt(v) => write!(f, "integer `{v}u`"),
            Token::Int(v) => write!(f, "integer `{v}`"),
            other => {
                let text = match other {
                    Token::Kernel => "kernel",
                    Token::Let => "let",
                    Token::If => "if",
                    Token::Else => "else",
                    Token::For => "for",
                    Token::In => "in",
                    Token::True => "true",
                    Token::False => "false",
                    Token::Buffer => "buffer",
                    Token::LParen => "(",
                    Token::RParen => ")",
                    Token::LBrace => "{",
                    Token::RBrace => "}",
                    Token::LBracket => "[",
                    Token::RBracket => "]",
                    Token::Comma => ",",
                    Token::Semi => ";",
                    Token::Colon => ":",
                    Token::DotDot => "..",
                    Token::Assign => "=",
                    Token::EqEq => "==",
                    Token::NotEq => "!=",
                    Token::Lt => "<",
                    Token::Le => "<=",
                    Token::Gt => ">",
                    Token::Ge => ">=",
                    Token::Plus => "+",
                    Token::Minus => "-",
                    Token::Star => "*",
                    Token::Slash => "/",
                    Token::Percent => "%",
                    Token::AndAnd => "&&",
                    Token::OrOr => "||",
                    Token::Bang => "!",
                    _ => "?",
                };
                write!(f, "`{text}`")
            }
        }
    }
}

/// Tokenize `src`, collecting one diagnostic per unrecognized lexeme.
pub fn lex(src: &str) -> Result<Vec<(Token, Span)>, Vec<Diagnostic>> {
    let mut tokens = Vec::new();
    let mut errors = Vec::new();
    for (tok, span) in Token::lexer(src).spanned() {
        match tok {
            Ok(tok) => tokens.push((tok, span)),
            Err(()) => {
                let text = &src[span.clone()];
                let message = if text.chars().all(|c| c.is_ascii_digit() || c == 'u') {
                    format!("integer literal `{text}` out of range")
                } else {
                    format!("unexpected character `{text}`")
                };
                errors.push(Diagnostic::new(message, span));
            }
        }
    }

    if errors.is_empty() {
        Ok(tokens)
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        lex(src).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn lexes_kernel_header() {
        assert_eq!(
            kinds("kernel k(a: buffer<f32>) // trailing\n{}"),
            vec![
                Token::Kernel,
                Token::Ident("k".into()),
                Token::LParen,
                Token::Ident("a".into()),
                Token::Colon,
                Token::Buffer,
                Token::Lt,
                Token::Ident("f32".into()),
                Token::Gt,
                Token::RParen,
                Token::LBrace,
                Token::RBrace,
            ]
        );
    }

    #[test]
    fn lexes_numbers_and_ranges() {
        assert_eq!(
            kinds("0..10u 2.5 <= 3"),
            vec![
                Token::Int(0),
                Token::DotDot,
                Token::UInt(10),
                Token::Float(2.5),
                Token::Le,
                Token::Int(3),
            ]
        );
    }

    #[test]
    fn reports_unknown_characters_with_spans() {
        let errs = lex("let x = #;").unwrap_err();
        assert_eq!(errs.len(), 1);
        assert_eq!(errs[0].span, 8..9);
        assert!(errs[0].message.contains('#'));
    }
}
