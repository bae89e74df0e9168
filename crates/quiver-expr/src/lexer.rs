//! Tokenizer for the Quiver expression language.
//!
//! Byte-level scanner; `#` starts a line comment, newlines and `;` both act
//! as statement separators. Offsets are byte positions into the source, kept
//! for parse-error reporting.

use quiver_types::{QuiverError, Result};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Ident(String),
    Int(i64),
    Float(f64),
    Str(String),
    True,
    False,
    Null,

    Assign, // =
    Eq,     // ==
    NotEq,  // !=
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    AndAnd,
    OrOr,
    Bang,

    Dot,
    Comma,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Semi, // `;` or newline
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub offset: usize,
}

fn lex_error(source: &str, offset: usize, message: impl Into<String>) -> QuiverError {
    QuiverError::EvalParse {
        expression: source.to_string(),
        offset,
        message: message.into(),
    }
}

/// Tokenize `source` into a flat token stream.
///
/// Consecutive separators collapse into one `Semi`; leading and trailing
/// separators are dropped so the parser only sees separators between
/// statements.
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>> {
    let bytes = source.as_bytes();
    let len = bytes.len();
    let mut tokens: Vec<SpannedToken> = Vec::new();
    let mut i = 0;

    let mut push = |token: Token, offset: usize, tokens: &mut Vec<SpannedToken>| {
        if token == Token::Semi {
            match tokens.last() {
                None | Some(SpannedToken { token: Token::Semi, .. }) => return,
                _ => {}
            }
        }
        tokens.push(SpannedToken { token, offset });
    };

    while i < len {
        let start = i;
        let c = bytes[i];
        match c {
            b' ' | b'\t' | b'\r' => i += 1,
            b'\n' => {
                push(Token::Semi, start, &mut tokens);
                i += 1;
            }
            b'#' => {
                while i < len && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b';' => {
                push(Token::Semi, start, &mut tokens);
                i += 1;
            }
            b'"' | b'\'' => {
                let quote = c;
                i += 1;
                let mut s = String::new();
                loop {
                    if i >= len {
                        return Err(lex_error(source, start, "unterminated string literal"));
                    }
                    match bytes[i] {
                        b'\\' if i + 1 < len => {
                            match bytes[i + 1] {
                                b'n' => s.push('\n'),
                                b't' => s.push('\t'),
                                b'\\' => s.push('\\'),
                                b'"' => s.push('"'),
                                b'\'' => s.push('\''),
                                other => {
                                    s.push('\\');
                                    s.push(other as char);
                                }
                            }
                            i += 2;
                        }
                        q if q == quote => {
                            i += 1;
                            break;
                        }
                        _ => {
                            // Multi-byte chars are copied through via str slicing.
                            let ch_len = utf8_len(bytes[i]);
                            s.push_str(&source[i..i + ch_len]);
                            i += ch_len;
                        }
                    }
                }
                push(Token::Str(s), start, &mut tokens);
            }
            b'0'..=b'9' => {
                let mut is_float = false;
                while i < len && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                if i + 1 < len && bytes[i] == b'.' && bytes[i + 1].is_ascii_digit() {
                    is_float = true;
                    i += 1;
                    while i < len && bytes[i].is_ascii_digit() {
                        i += 1;
                    }
                }
                let text = &source[start..i];
                let token = if is_float {
                    Token::Float(text.parse().map_err(|_| {
                        lex_error(source, start, format!("invalid float literal '{text}'"))
                    })?)
                } else {
                    Token::Int(text.parse().map_err(|_| {
                        lex_error(source, start, format!("integer literal '{text}' out of range"))
                    })?)
                };
                push(token, start, &mut tokens);
            }
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => {
                while i < len && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                let word = &source[start..i];
                let token = match word {
                    "true" | "True" => Token::True,
                    "false" | "False" => Token::False,
                    "null" | "None" => Token::Null,
                    "and" => Token::AndAnd,
                    "or" => Token::OrOr,
                    "not" => Token::Bang,
                    _ => Token::Ident(word.to_string()),
                };
                push(token, start, &mut tokens);
            }
            b'=' => {
                if i + 1 < len && bytes[i + 1] == b'=' {
                    push(Token::Eq, start, &mut tokens);
                    i += 2;
                } else {
                    push(Token::Assign, start, &mut tokens);
                    i += 1;
                }
            }
            b'!' => {
                if i + 1 < len && bytes[i + 1] == b'=' {
                    push(Token::NotEq, start, &mut tokens);
                    i += 2;
                } else {
                    push(Token::Bang, start, &mut tokens);
                    i += 1;
                }
            }
            b'<' => {
                if i + 1 < len && bytes[i + 1] == b'=' {
                    push(Token::Le, start, &mut tokens);
                    i += 2;
                } else {
                    push(Token::Lt, start, &mut tokens);
                    i += 1;
                }
            }
            b'>' => {
                if i + 1 < len && bytes[i + 1] == b'=' {
                    push(Token::Ge, start, &mut tokens);
                    i += 2;
                } else {
                    push(Token::Gt, start, &mut tokens);
                    i += 1;
                }
            }
            b'&' => {
                if i + 1 < len && bytes[i + 1] == b'&' {
                    push(Token::AndAnd, start, &mut tokens);
                    i += 2;
                } else {
                    return Err(lex_error(source, start, "expected '&&'"));
                }
            }
            b'|' => {
                if i + 1 < len && bytes[i + 1] == b'|' {
                    push(Token::OrOr, start, &mut tokens);
                    i += 2;
                } else {
                    return Err(lex_error(source, start, "expected '||'"));
                }
            }
            b'+' => {
                push(Token::Plus, start, &mut tokens);
                i += 1;
            }
            b'-' => {
                push(Token::Minus, start, &mut tokens);
                i += 1;
            }
            b'*' => {
                push(Token::Star, start, &mut tokens);
                i += 1;
            }
            b'/' => {
                push(Token::Slash, start, &mut tokens);
                i += 1;
            }
            b'%' => {
                push(Token::Percent, start, &mut tokens);
                i += 1;
            }
            b'.' => {
                push(Token::Dot, start, &mut tokens);
                i += 1;
            }
            b',' => {
                push(Token::Comma, start, &mut tokens);
                i += 1;
            }
            b':' => {
                push(Token::Colon, start, &mut tokens);
                i += 1;
            }
            b'(' => {
                push(Token::LParen, start, &mut tokens);
                i += 1;
            }
            b')' => {
                push(Token::RParen, start, &mut tokens);
                i += 1;
            }
            b'[' => {
                push(Token::LBracket, start, &mut tokens);
                i += 1;
            }
            b']' => {
                push(Token::RBracket, start, &mut tokens);
                i += 1;
            }
            b'{' => {
                push(Token::LBrace, start, &mut tokens);
                i += 1;
            }
            b'}' => {
                push(Token::RBrace, start, &mut tokens);
                i += 1;
            }
            other => {
                return Err(lex_error(
                    source,
                    start,
                    format!("unexpected character '{}'", other as char),
                ));
            }
        }
    }

    while matches!(tokens.last(), Some(SpannedToken { token: Token::Semi, .. })) {
        tokens.pop();
    }
    Ok(tokens)
}

fn utf8_len(first_byte: u8) -> usize {
    match first_byte {
        0x00..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|t| t.token).collect()
    }

    #[test]
    fn tokenize_assignment() {
        assert_eq!(
            toks("config.doWrite = false"),
            vec![
                Token::Ident("config".into()),
                Token::Dot,
                Token::Ident("doWrite".into()),
                Token::Assign,
                Token::False,
            ]
        );
    }

    #[test]
    fn tokenize_comparison_chain() {
        assert_eq!(
            toks("a.x == b.x && a.n >= 3"),
            vec![
                Token::Ident("a".into()),
                Token::Dot,
                Token::Ident("x".into()),
                Token::Eq,
                Token::Ident("b".into()),
                Token::Dot,
                Token::Ident("x".into()),
                Token::AndAnd,
                Token::Ident("a".into()),
                Token::Dot,
                Token::Ident("n".into()),
                Token::Ge,
                Token::Int(3),
            ]
        );
    }

    #[test]
    fn tokenize_word_operators() {
        assert_eq!(
            toks("a and not b or c"),
            vec![
                Token::Ident("a".into()),
                Token::AndAnd,
                Token::Bang,
                Token::Ident("b".into()),
                Token::OrOr,
                Token::Ident("c".into()),
            ]
        );
    }

    #[test]
    fn tokenize_numbers_and_strings() {
        assert_eq!(
            toks(r#"[1, 2.5, "deep", 'warp']"#),
            vec![
                Token::LBracket,
                Token::Int(1),
                Token::Comma,
                Token::Float(2.5),
                Token::Comma,
                Token::Str("deep".into()),
                Token::Comma,
                Token::Str("warp".into()),
                Token::RBracket,
            ]
        );
    }

    #[test]
    fn newlines_and_semicolons_collapse() {
        assert_eq!(
            toks("a = 1\n\n;\nb = 2\n"),
            vec![
                Token::Ident("a".into()),
                Token::Assign,
                Token::Int(1),
                Token::Semi,
                Token::Ident("b".into()),
                Token::Assign,
                Token::Int(2),
            ]
        );
    }

    #[test]
    fn comments_skipped() {
        assert_eq!(
            toks("a = 1 # set a\nb = 2"),
            vec![
                Token::Ident("a".into()),
                Token::Assign,
                Token::Int(1),
                Token::Semi,
                Token::Ident("b".into()),
                Token::Assign,
                Token::Int(2),
            ]
        );
    }

    #[test]
    fn string_escapes() {
        assert_eq!(toks(r#""a\nb""#), vec![Token::Str("a\nb".into())]);
        assert_eq!(toks(r#""say \"hi\"""#), vec![Token::Str("say \"hi\"".into())]);
    }

    #[test]
    fn unterminated_string_is_error() {
        let err = tokenize("\"open").unwrap_err();
        assert!(err.to_string().contains("unterminated"));
    }

    #[test]
    fn python_spellings_of_literals() {
        assert_eq!(toks("True"), vec![Token::True]);
        assert_eq!(toks("False"), vec![Token::False]);
        assert_eq!(toks("None"), vec![Token::Null]);
    }

    #[test]
    fn unexpected_character_is_error() {
        let err = tokenize("a @ b").unwrap_err();
        assert!(err.to_string().contains("unexpected character '@'"));
    }
}
