//! Lexer for script source.
//!
//! Converts source text into a flat token stream. Comments and whitespace
//! are skipped; every token carries the span where it started.

use crate::engine::span::Span;
use crate::engine::token::{Token, TokenKind};
use crate::error::ParseError;

// ============================================================================
// Cursor
// ============================================================================

/// A cursor over source text that tracks line and column.
struct Cursor<'src> {
    rest: &'src str,
    line: u32,
    col: u32,
}

impl<'src> Cursor<'src> {
    fn new(source: &'src str) -> Self {
        Self {
            rest: source,
            line: 1,
            col: 1,
        }
    }

    #[inline]
    fn is_eof(&self) -> bool {
        self.rest.is_empty()
    }

    #[inline]
    fn peek(&self) -> Option<char> {
        self.rest.chars().next()
    }

    #[inline]
    fn peek_second(&self) -> Option<char> {
        let mut chars = self.rest.chars();
        chars.next();
        chars.next()
    }

    #[inline]
    fn pos(&self) -> Span {
        Span::point(self.line, self.col)
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.rest.chars().next()?;
        self.rest = &self.rest[ch.len_utf8()..];
        if ch == '\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(ch)
    }

    /// Consume characters while `pred` holds, returning the consumed slice.
    fn eat_while(&mut self, pred: impl Fn(char) -> bool) -> &'src str {
        let start = self.rest;
        let mut len = 0;
        while let Some(ch) = self.peek() {
            if !pred(ch) {
                break;
            }
            len += ch.len_utf8();
            self.bump();
        }
        &start[..len]
    }
}

// ============================================================================
// Lexer
// ============================================================================

/// Tokenize `source` into a stream ending with an `Eof` token.
pub fn tokenize(source: &str) -> Result<Vec<Token>, ParseError> {
    let mut cursor = Cursor::new(source);
    let mut tokens = Vec::new();

    loop {
        skip_trivia(&mut cursor)?;
        if cursor.is_eof() {
            tokens.push(Token::new(TokenKind::Eof, cursor.pos()));
            return Ok(tokens);
        }
        tokens.push(next_token(&mut cursor)?);
    }
}

/// Skip whitespace and comments.
fn skip_trivia(cursor: &mut Cursor<'_>) -> Result<(), ParseError> {
    loop {
        cursor.eat_while(|ch| ch.is_whitespace());
        match (cursor.peek(), cursor.peek_second()) {
            (Some('/'), Some('/')) => {
                cursor.eat_while(|ch| ch != '\n');
            }
            (Some('/'), Some('*')) => {
                let start = cursor.pos();
                cursor.bump();
                cursor.bump();
                loop {
                    match (cursor.peek(), cursor.peek_second()) {
                        (Some('*'), Some('/')) => {
                            cursor.bump();
                            cursor.bump();
                            break;
                        }
                        (Some(_), _) => {
                            cursor.bump();
                        }
                        (None, _) => {
                            return Err(ParseError::UnterminatedComment { span: start });
                        }
                    }
                }
            }
            _ => return Ok(()),
        }
    }
}

fn next_token(cursor: &mut Cursor<'_>) -> Result<Token, ParseError> {
    let span = cursor.pos();
    let ch = match cursor.peek() {
        Some(ch) => ch,
        None => return Ok(Token::new(TokenKind::Eof, span)),
    };

    if ch.is_ascii_digit() {
        return number(cursor, span);
    }
    if ch.is_alphabetic() || ch == '_' || ch == '$' {
        return Ok(ident_or_keyword(cursor, span));
    }
    if ch == '"' || ch == '\'' {
        return string(cursor, span);
    }

    cursor.bump();
    let kind = match ch {
        '(' => TokenKind::LParen,
        ')' => TokenKind::RParen,
        '{' => TokenKind::LBrace,
        '}' => TokenKind::RBrace,
        '[' => TokenKind::LBracket,
        ']' => TokenKind::RBracket,
        ',' => TokenKind::Comma,
        ';' => TokenKind::Semicolon,
        ':' => TokenKind::Colon,
        '.' => TokenKind::Dot,
        '?' => TokenKind::Question,
        '%' => TokenKind::Percent,
        '+' => {
            if cursor.peek() == Some('=') {
                cursor.bump();
                TokenKind::PlusAssign
            } else {
                TokenKind::Plus
            }
        }
        '-' => {
            if cursor.peek() == Some('=') {
                cursor.bump();
                TokenKind::MinusAssign
            } else {
                TokenKind::Minus
            }
        }
        '*' => {
            if cursor.peek() == Some('=') {
                cursor.bump();
                TokenKind::StarAssign
            } else {
                TokenKind::Star
            }
        }
        '/' => {
            if cursor.peek() == Some('=') {
                cursor.bump();
                TokenKind::SlashAssign
            } else {
                TokenKind::Slash
            }
        }
        '=' => match cursor.peek() {
            Some('=') => {
                cursor.bump();
                if cursor.peek() == Some('=') {
                    cursor.bump();
                    TokenKind::EqEqEq
                } else {
                    TokenKind::EqEq
                }
            }
            Some('>') => {
                cursor.bump();
                TokenKind::Arrow
            }
            _ => TokenKind::Assign,
        },
        '!' => {
            if cursor.peek() == Some('=') {
                cursor.bump();
                if cursor.peek() == Some('=') {
                    cursor.bump();
                    TokenKind::NotEqEq
                } else {
                    TokenKind::NotEq
                }
            } else {
                TokenKind::Not
            }
        }
        '<' => {
            if cursor.peek() == Some('=') {
                cursor.bump();
                TokenKind::Le
            } else {
                TokenKind::Lt
            }
        }
        '>' => {
            if cursor.peek() == Some('=') {
                cursor.bump();
                TokenKind::Ge
            } else {
                TokenKind::Gt
            }
        }
        '&' => {
            if cursor.peek() == Some('&') {
                cursor.bump();
                TokenKind::AndAnd
            } else {
                return Err(ParseError::UnexpectedChar { ch, span });
            }
        }
        '|' => {
            if cursor.peek() == Some('|') {
                cursor.bump();
                TokenKind::OrOr
            } else {
                return Err(ParseError::UnexpectedChar { ch, span });
            }
        }
        _ => return Err(ParseError::UnexpectedChar { ch, span }),
    };
    Ok(Token::new(kind, span))
}

fn ident_or_keyword(cursor: &mut Cursor<'_>, span: Span) -> Token {
    let lexeme = cursor.eat_while(|ch| ch.is_alphanumeric() || ch == '_' || ch == '$');
    let kind = TokenKind::keyword(lexeme).unwrap_or_else(|| TokenKind::Ident(lexeme.to_string()));
    Token::new(kind, span)
}

fn number(cursor: &mut Cursor<'_>, span: Span) -> Result<Token, ParseError> {
    let mut text = cursor.eat_while(|ch| ch.is_ascii_digit()).to_string();
    let mut is_float = false;

    // Fractional part only when a digit follows the dot, so `1.foo` lexes
    // as an integer followed by a member access.
    if cursor.peek() == Some('.') && cursor.peek_second().is_some_and(|ch| ch.is_ascii_digit()) {
        is_float = true;
        cursor.bump();
        text.push('.');
        text.push_str(cursor.eat_while(|ch| ch.is_ascii_digit()));
    }

    if matches!(cursor.peek(), Some('e') | Some('E')) {
        is_float = true;
        cursor.bump();
        text.push('e');
        if matches!(cursor.peek(), Some('+') | Some('-')) {
            text.push(cursor.bump().unwrap_or('+'));
        }
        let digits = cursor.eat_while(|ch| ch.is_ascii_digit());
        if digits.is_empty() {
            return Err(ParseError::InvalidNumber { span });
        }
        text.push_str(digits);
    }

    let kind = if is_float {
        match text.parse::<f64>() {
            Ok(v) => TokenKind::Float(v),
            Err(_) => return Err(ParseError::InvalidNumber { span }),
        }
    } else {
        // Integers that fit in 32 bits keep the integer tag, larger
        // literals fall back to floats.
        match text.parse::<i64>() {
            Ok(v) if v <= i32::MAX as i64 => TokenKind::Int(v as i32),
            Ok(v) => TokenKind::Float(v as f64),
            Err(_) => return Err(ParseError::InvalidNumber { span }),
        }
    };
    Ok(Token::new(kind, span))
}

fn string(cursor: &mut Cursor<'_>, span: Span) -> Result<Token, ParseError> {
    let quote = match cursor.bump() {
        Some(ch) => ch,
        None => return Err(ParseError::UnterminatedString { span }),
    };
    let mut text = String::new();
    loop {
        match cursor.bump() {
            None | Some('\n') => return Err(ParseError::UnterminatedString { span }),
            Some(ch) if ch == quote => break,
            Some('\\') => {
                let escape_span = cursor.pos();
                match cursor.bump() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('0') => text.push('\0'),
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some('\'') => text.push('\''),
                    Some(ch) => {
                        return Err(ParseError::InvalidEscape {
                            ch,
                            span: escape_span,
                        });
                    }
                    None => return Err(ParseError::UnterminatedString { span }),
                }
            }
            Some(ch) => text.push(ch),
        }
    }
    Ok(Token::new(TokenKind::Str(text), span))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        tokenize(source)
            .expect("tokenize failed")
            .into_iter()
            .map(|t| t.kind)
            .collect()
    }

    #[test]
    fn tokenize_simple_expression() {
        assert_eq!(
            kinds("1 + 2"),
            vec![
                TokenKind::Int(1),
                TokenKind::Plus,
                TokenKind::Int(2),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn tokenize_keywords_and_idents() {
        assert_eq!(
            kinds("let x"),
            vec![
                TokenKind::Let,
                TokenKind::Ident("x".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn tokenize_float_and_int_literals() {
        assert_eq!(kinds("2.5")[0], TokenKind::Float(2.5));
        assert_eq!(kinds("1e3")[0], TokenKind::Float(1000.0));
        assert_eq!(kinds("42")[0], TokenKind::Int(42));
        // Too large for the integer tag.
        assert_eq!(kinds("3000000000")[0], TokenKind::Float(3000000000.0));
    }

    #[test]
    fn tokenize_integer_then_member() {
        assert_eq!(
            kinds("1.x"),
            vec![
                TokenKind::Int(1),
                TokenKind::Dot,
                TokenKind::Ident("x".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn tokenize_string_escapes() {
        assert_eq!(
            kinds(r#""a\nb""#)[0],
            TokenKind::Str("a\nb".to_string())
        );
        assert_eq!(kinds("'it'")[0], TokenKind::Str("it".to_string()));
    }

    #[test]
    fn tokenize_multi_char_operators() {
        assert_eq!(
            kinds("a === b !== c => d"),
            vec![
                TokenKind::Ident("a".to_string()),
                TokenKind::EqEqEq,
                TokenKind::Ident("b".to_string()),
                TokenKind::NotEqEq,
                TokenKind::Ident("c".to_string()),
                TokenKind::Arrow,
                TokenKind::Ident("d".to_string()),
                TokenKind::Eof
            ]
        );
    }

    #[test]
    fn tokenize_skips_comments() {
        assert_eq!(
            kinds("1 // line\n/* block\n comment */ 2"),
            vec![TokenKind::Int(1), TokenKind::Int(2), TokenKind::Eof]
        );
    }

    #[test]
    fn unterminated_string_is_an_error() {
        let err = tokenize("\"abc").unwrap_err();
        assert!(matches!(err, ParseError::UnterminatedString { .. }));
    }

    #[test]
    fn unterminated_comment_is_an_error() {
        let err = tokenize("/* abc").unwrap_err();
        assert!(matches!(err, ParseError::UnterminatedComment { .. }));
    }

    #[test]
    fn spans_track_lines() {
        let tokens = tokenize("a\n  b").expect("tokenize failed");
        assert_eq!(tokens[0].span, Span::point(1, 1));
        assert_eq!(tokens[1].span, Span::point(2, 3));
    }

    #[test]
    fn stray_character_is_an_error() {
        let err = tokenize("a # b").unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedChar { ch: '#', .. }));
    }
}
