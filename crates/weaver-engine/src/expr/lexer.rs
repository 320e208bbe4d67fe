use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    True,
    False,
    Null,
    And,
    Or,
    Not,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Eof,
}

impl Token {
    pub fn describe(&self) -> String {
        match self {
            Self::Number(n) => format!("number {}", n),
            Self::Str(s) => format!("string \"{}\"", s),
            Self::Ident(s) => format!("identifier '{}'", s),
            Self::Eof => "end of expression".to_string(),
            other => format!("{:?}", other),
        }
    }
}

/// A token with its byte offset in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned {
    pub token: Token,
    pub pos: usize,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, ExprError> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let two = chars.get(i + 1).map(|(_, c)| *c);
        let (token, width) = match (c, two) {
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Not, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('.', _) => (Token::Dot, 1),
            ('[', _) => (Token::LBracket, 1),
            (']', _) => (Token::RBracket, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('"', _) | ('\'', _) => {
                let (text, consumed) = read_string(&chars, i)?;
                tokens.push(Spanned {
                    token: Token::Str(text),
                    pos,
                });
                i += consumed;
                continue;
            }
            (c, _) if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                    // A dot followed by a non-digit is member access, not a fraction
                    if chars[i].1 == '.'
                        && !chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit())
                    {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ExprError::InvalidNumber(text.clone()))?;
                tokens.push(Spanned {
                    token: Token::Number(value),
                    pos,
                });
                continue;
            }
            (c, _) if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let token = match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                };
                tokens.push(Spanned { token, pos });
                continue;
            }
            (c, _) => return Err(ExprError::UnexpectedChar { ch: c, pos }),
        };

        tokens.push(Spanned { token, pos });
        i += width;
    }

    tokens.push(Spanned {
        token: Token::Eof,
        pos: source.len(),
    });
    Ok(tokens)
}

/// Read a quoted string starting at `start`; returns the text and the number of chars consumed.
fn read_string(chars: &[(usize, char)], start: usize) -> Result<(String, usize), ExprError> {
    let quote = chars[start].1;
    let mut text = String::new();
    let mut i = start + 1;

    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((text, i - start + 1));
        }
        if c == '\\' {
            i += 1;
            match chars.get(i).map(|(_, c)| *c) {
                Some('n') => text.push('\n'),
                Some('t') => text.push('\t'),
                Some(other) => text.push(other),
                None => break,
            }
        } else {
            text.push(c);
        }
        i += 1;
    }

    Err(ExprError::UnterminatedString(chars[start].0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<Token> {
        tokenize(src).unwrap().into_iter().map(|s| s.token).collect()
    }

    #[test]
    fn operators_and_keywords() {
        assert_eq!(
            kinds("a >= 2 and not b || c != 'x'"),
            vec![
                Token::Ident("a".into()),
                Token::Ge,
                Token::Number(2.0),
                Token::And,
                Token::Not,
                Token::Ident("b".into()),
                Token::Or,
                Token::Ident("c".into()),
                Token::Ne,
                Token::Str("x".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn member_access_after_number_index() {
        assert_eq!(
            kinds("items[0].name"),
            vec![
                Token::Ident("items".into()),
                Token::LBracket,
                Token::Number(0.0),
                Token::RBracket,
                Token::Dot,
                Token::Ident("name".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn decimals_and_escapes() {
        assert_eq!(
            kinds(r#"1.5 "a\"b""#),
            vec![Token::Number(1.5), Token::Str("a\"b".into()), Token::Eof]
        );
    }

    #[test]
    fn errors() {
        assert!(matches!(
            tokenize("a # b"),
            Err(ExprError::UnexpectedChar { ch: '#', pos: 2 })
        ));
        assert!(matches!(
            tokenize("'open"),
            Err(ExprError::UnterminatedString(0))
        ));
    }
}
