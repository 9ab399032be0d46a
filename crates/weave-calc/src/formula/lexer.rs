//! Tokenizer for formula source text.
//!
//! Shared by the static dependency analysis and the built-in evaluator.

use super::FormulaError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    /// `#name`: the tag on every bot.
    TagRef(String),
    /// `@id`: a bot by id.
    BotRef(String),
    Ident(String),
    Dot,
    Comma,
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
}

/// A token and the char offset it starts at.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub offset: usize,
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Split `source` into tokens.
///
/// # Errors
///
/// [`FormulaError::Parse`] for unterminated strings, empty references and
/// unexpected characters.
pub fn tokenize(source: &str) -> Result<Vec<Spanned>, FormulaError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let fail = |offset: usize, message: &str| FormulaError::Parse {
        offset,
        message: message.to_string(),
    };

    while i < chars.len() {
        let c = chars[i];
        let start = i;
        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '.' if !chars.get(i + 1).is_some_and(char::is_ascii_digit) => {
                i += 1;
                Token::Dot
            }
            ',' | '(' | ')' | '+' | '-' | '*' | '/' => {
                i += 1;
                match c {
                    ',' => Token::Comma,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    _ => Token::Slash,
                }
            }
            '"' | '\'' => {
                i += 1;
                let mut text = String::new();
                loop {
                    match chars.get(i) {
                        None => return Err(fail(start, "unterminated string")),
                        Some(&q) if q == c => break,
                        Some('\\') if i + 1 < chars.len() => {
                            text.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&other) => {
                            text.push(other);
                            i += 1;
                        }
                    }
                }
                i += 1;
                Token::Str(text)
            }
            '#' | '@' => {
                i += 1;
                let name = take_while(&chars, &mut i, is_name_char);
                if name.is_empty() {
                    return Err(fail(start, "expected a name"));
                }
                if c == '#' {
                    Token::TagRef(name)
                } else {
                    Token::BotRef(name)
                }
            }
            c if c.is_ascii_digit() || c == '.' => {
                let text = take_while(&chars, &mut i, |c| c.is_ascii_digit() || c == '.');
                let n = text
                    .parse::<f64>()
                    .map_err(|_| fail(start, "malformed number"))?;
                Token::Number(n)
            }
            c if is_name_char(c) => Token::Ident(take_while(&chars, &mut i, is_name_char)),
            other => return Err(fail(start, &format!("unexpected '{other}'"))),
        };
        tokens.push(Spanned {
            token,
            offset: start,
        });
    }
    Ok(tokens)
}

fn take_while(chars: &[char], i: &mut usize, keep: impl Fn(char) -> bool) -> String {
    let start = *i;
    while *i < chars.len() && keep(chars[*i]) {
        *i += 1;
    }
    chars[start..*i].iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source)
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .collect()
    }

    #[test]
    fn references_and_calls() {
        assert_eq!(kinds("sum(#num) + @a.total"), vec![
            Token::Ident("sum".into()),
            Token::LParen,
            Token::TagRef("num".into()),
            Token::RParen,
            Token::Plus,
            Token::BotRef("a".into()),
            Token::Dot,
            Token::Ident("total".into()),
        ]);
    }

    #[test]
    fn numbers_and_strings() {
        assert_eq!(kinds("1.5 * .5 'it\\'s'"), vec![
            Token::Number(1.5),
            Token::Star,
            Token::Number(0.5),
            Token::Str("it's".into()),
        ]);
    }

    #[test]
    fn errors_carry_offsets() {
        assert_eq!(
            tokenize("1 + \"open").unwrap_err(),
            FormulaError::Parse {
                offset: 4,
                message: "unterminated string".into()
            }
        );
        assert!(matches!(
            tokenize("# x"),
            Err(FormulaError::Parse { offset: 0, .. })
        ));
        assert!(matches!(
            tokenize("1..2"),
            Err(FormulaError::Parse { offset: 0, .. })
        ));
        assert!(matches!(tokenize("a ; b"), Err(FormulaError::Parse { offset: 2, .. })));
    }
}
