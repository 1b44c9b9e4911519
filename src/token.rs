use crate::error::Span;

use core::fmt;
use logos::{Lexer, Logos};

#[derive(Logos, Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum TokenType {
    #[regex("[a-zA-Z_$][a-zA-Z0-9_$]*")]
    Ident,
    #[regex("\"[^\"]*\"")]
    #[regex("'[^']*'")]
    String,
    #[regex(r"[0-9]+(\.[0-9]+)?([eE][+-]?[0-9]+)?")]
    #[regex("0[xX][0-9a-fA-F]+")]
    Number,
    #[regex(r"//[^\n]*")]
    #[regex(r"/\*([^*]|\*[^/])*\*/")]
    Comment,
    #[regex(r"[ \t\r\n\f]+")]
    Whitespace,
    #[error]
    Error,

    #[token("var")]
    Var,
    #[token("if")]
    If,
    #[token("else")]
    Else,
    #[token("function")]
    Function,
    #[token("return")]
    Return,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,

    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token("[")]
    LeftBracket,
    #[token("]")]
    RightBracket,
    #[token(",")]
    Comma,
    #[token(";")]
    Semicolon,
    #[token(".")]
    Dot,
    #[token("=>")]
    FatArrow,
    #[token("=")]
    Equal,
    #[token("==")]
    IsEqual,
    #[token("!=")]
    IsNotEqual,
    #[token("<")]
    LeftCaret,
    #[token("<=")]
    LessThanEqual,
    #[token(">")]
    RightCaret,
    #[token(">=")]
    GreaterThanEqual,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("**")]
    DoubleStar,
    #[token("/")]
    Divide,
    #[token("!")]
    Bang,
    #[token("&&")]
    And,
    #[token("||")]
    Or,
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let string = match self {
            Self::Ident => "identifier",
            Self::String => "string",
            Self::Number => "number",
            Self::Comment => "comment",
            Self::Whitespace => "whitespace",
            Self::Error => "error",
            Self::Var => "var",
            Self::If => "if",
            Self::Else => "else",
            Self::Function => "function",
            Self::Return => "return",
            Self::True => "true",
            Self::False => "false",
            Self::Null => "null",
            Self::LeftParen => "(",
            Self::RightParen => ")",
            Self::LeftBrace => "{",
            Self::RightBrace => "}",
            Self::LeftBracket => "[",
            Self::RightBracket => "]",
            Self::Comma => ",",
            Self::Semicolon => ";",
            Self::Dot => ".",
            Self::FatArrow => "=>",
            Self::Equal => "=",
            Self::IsEqual => "==",
            Self::IsNotEqual => "!=",
            Self::LeftCaret => "<",
            Self::LessThanEqual => "<=",
            Self::RightCaret => ">",
            Self::GreaterThanEqual => ">=",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::DoubleStar => "**",
            Self::Divide => "/",
            Self::Bang => "!",
            Self::And => "&&",
            Self::Or => "||",
        };

        write!(f, "{}", string)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token<'a> {
    ty: TokenType,
    source: &'a str,
    span: Span,
}

impl<'a> Token<'a> {
    pub fn ty(&self) -> TokenType {
        self.ty
    }

    pub fn source(&self) -> &'a str {
        self.source
    }

    pub fn span(&self) -> Span {
        self.span
    }

    /// Numeric value of a `Number` token.
    pub fn float_value(&self) -> Option<f64> {
        if self.ty != TokenType::Number {
            return None;
        }
        if self.source.starts_with("0x") || self.source.starts_with("0X") {
            return u64::from_str_radix(&self.source[2..], 16)
                .ok()
                .map(|v| v as f64);
        }
        lexical_core::parse(self.source.as_bytes()).ok()
    }

    /// Contents of a `String` token, quotes stripped.
    pub fn string_value(&self) -> Option<&'a str> {
        if self.ty != TokenType::String {
            return None;
        }
        Some(&self.source[1..self.source.len() - 1])
    }
}

/// Iterator over meaningful tokens; whitespace and comments are skipped.
pub struct TokenStream<'a> {
    lexer: Lexer<'a, TokenType>,
    source: &'a str,
}

impl<'a> TokenStream<'a> {
    pub fn new(source: &'a str) -> Self {
        Self {
            lexer: TokenType::lexer(source),
            source,
        }
    }
}

impl<'a> Iterator for TokenStream<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let ty = self.lexer.next()?;
            if ty == TokenType::Whitespace || ty == TokenType::Comment {
                continue;
            }

            let range = self.lexer.span();
            return Some(Token {
                ty,
                source: &self.source[range.clone()],
                span: Span::from(range),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(src: &str) -> Vec<TokenType> {
        TokenStream::new(src).map(|t| t.ty()).collect()
    }

    #[test]
    fn skips_trivia() {
        assert_eq!(
            types("var x = 1 // trailing\n/* block */ ;"),
            vec![
                TokenType::Var,
                TokenType::Ident,
                TokenType::Equal,
                TokenType::Number,
                TokenType::Semicolon,
            ],
        );
    }

    #[test]
    fn number_values() {
        let toks: Vec<_> = TokenStream::new("1 2.5 0x10 1e3").collect();
        let vals: Vec<f64> = toks.iter().map(|t| t.float_value().unwrap()).collect();
        assert_eq!(vals, vec![1.0, 2.5, 16.0, 1000.0]);
    }

    #[test]
    fn string_values() {
        let toks: Vec<_> = TokenStream::new("\"abc\" 'd'").collect();
        assert_eq!(toks[0].string_value(), Some("abc"));
        assert_eq!(toks[1].string_value(), Some("d"));
    }

    #[test]
    fn two_char_operators() {
        assert_eq!(
            types("a => b ** c <= d"),
            vec![
                TokenType::Ident,
                TokenType::FatArrow,
                TokenType::Ident,
                TokenType::DoubleStar,
                TokenType::Ident,
                TokenType::LessThanEqual,
                TokenType::Ident,
            ],
        );
    }

    #[test]
    fn spans_track_source() {
        let toks: Vec<_> = TokenStream::new("var  abc").collect();
        assert_eq!(toks[1].source(), "abc");
        assert_eq!(toks[1].span(), Span::new(5, 8));
    }
}
