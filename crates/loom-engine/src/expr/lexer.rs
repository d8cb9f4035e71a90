use super::ExprError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Tok {
    Int(i64),
    Float(f64),
    Str(String),
    Name(String),
    // keywords
    And,
    Or,
    Not,
    In,
    Is,
    If,
    Else,
    For,
    Lambda,
    None,
    True,
    False,
    // operators
    Plus,
    Minus,
    Star,
    Slash,
    DoubleSlash,
    Percent,
    DoubleStar,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Assign,
    Walrus,
    Bitwise(&'static str),
    // punctuation
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Eof,
}

impl Tok {
    pub(crate) fn describe(&self) -> String {
        match self {
            Tok::Int(i) => i.to_string(),
            Tok::Float(f) => f.to_string(),
            Tok::Str(s) => format!("'{}'", s),
            Tok::Name(n) => n.clone(),
            Tok::Eof => "end of expression".to_string(),
            other => format!("{:?}", other),
        }
    }
}

/// A token with its byte offset in the source.
#[derive(Debug, Clone)]
pub(crate) struct Spanned {
    pub tok: Tok,
    pub pos: usize,
}

fn keyword(word: &str) -> Option<Tok> {
    Some(match word {
        "and" => Tok::And,
        "or" => Tok::Or,
        "not" => Tok::Not,
        "in" => Tok::In,
        "is" => Tok::Is,
        "if" => Tok::If,
        "else" => Tok::Else,
        "for" => Tok::For,
        "lambda" => Tok::Lambda,
        "None" => Tok::None,
        "True" => Tok::True,
        "False" => Tok::False,
        _ => return None,
    })
}

pub(crate) fn tokenize(src: &str) -> Result<Vec<Spanned>, ExprError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let peek = |i: usize| chars.get(i).map(|&(_, c)| c);

    while i < chars.len() {
        let (pos, c) = chars[i];

        if c.is_whitespace() {
            i += 1;
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && peek(i + 1).is_some_and(|n| n.is_ascii_digit())) {
            let (tok, next) = lex_number(&chars, i)?;
            tokens.push(Spanned { tok, pos });
            i = next;
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while peek(i).is_some_and(|n| n.is_alphanumeric() || n == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().map(|&(_, c)| c).collect();
            let tok = keyword(&word).unwrap_or(Tok::Name(word));
            tokens.push(Spanned { tok, pos });
            continue;
        }

        if c == '\'' || c == '"' {
            let (s, next) = lex_string(&chars, i)?;
            tokens.push(Spanned { tok: Tok::Str(s), pos });
            i = next;
            continue;
        }

        let two: Option<Tok> = match (c, peek(i + 1)) {
            ('/', Some('/')) => Some(Tok::DoubleSlash),
            ('*', Some('*')) => Some(Tok::DoubleStar),
            ('=', Some('=')) => Some(Tok::EqEq),
            ('!', Some('=')) => Some(Tok::NotEq),
            ('<', Some('=')) => Some(Tok::Le),
            ('>', Some('=')) => Some(Tok::Ge),
            (':', Some('=')) => Some(Tok::Walrus),
            ('<', Some('<')) => Some(Tok::Bitwise("<<")),
            ('>', Some('>')) => Some(Tok::Bitwise(">>")),
            _ => None,
        };
        if let Some(tok) = two {
            tokens.push(Spanned { tok, pos });
            i += 2;
            continue;
        }

        let tok = match c {
            '+' => Tok::Plus,
            '-' => Tok::Minus,
            '*' => Tok::Star,
            '/' => Tok::Slash,
            '%' => Tok::Percent,
            '<' => Tok::Lt,
            '>' => Tok::Gt,
            '=' => Tok::Assign,
            '&' => Tok::Bitwise("&"),
            '|' => Tok::Bitwise("|"),
            '^' => Tok::Bitwise("^"),
            '~' => Tok::Bitwise("~"),
            '(' => Tok::LParen,
            ')' => Tok::RParen,
            '[' => Tok::LBracket,
            ']' => Tok::RBracket,
            '{' => Tok::LBrace,
            '}' => Tok::RBrace,
            ',' => Tok::Comma,
            ':' => Tok::Colon,
            '.' => Tok::Dot,
            other => {
                return Err(ExprError::Syntax(format!(
                    "unexpected character '{}' at position {}",
                    other, pos
                )))
            }
        };
        tokens.push(Spanned { tok, pos });
        i += 1;
    }

    tokens.push(Spanned {
        tok: Tok::Eof,
        pos: src.len(),
    });
    Ok(tokens)
}

fn lex_number(chars: &[(usize, char)], start: usize) -> Result<(Tok, usize), ExprError> {
    let mut i = start;
    let mut text = String::new();
    let mut is_float = false;
    let at = |i: usize| chars.get(i).map(|&(_, c)| c);

    while let Some(c) = at(i) {
        if c.is_ascii_digit() {
            text.push(c);
        } else if c == '_' && at(i + 1).is_some_and(|n| n.is_ascii_digit()) {
            // digit separator
        } else if c == '.' && !is_float {
            is_float = true;
            text.push(c);
        } else if (c == 'e' || c == 'E')
            && (at(i + 1).is_some_and(|n| n.is_ascii_digit())
                || (matches!(at(i + 1), Some('+') | Some('-'))
                    && at(i + 2).is_some_and(|n| n.is_ascii_digit())))
        {
            is_float = true;
            text.push('e');
            if let Some(sign @ ('+' | '-')) = at(i + 1) {
                text.push(sign);
                i += 1;
            }
        } else {
            break;
        }
        i += 1;
    }

    let pos = chars[start].0;
    if is_float {
        text.parse::<f64>()
            .map(|f| (Tok::Float(f), i))
            .map_err(|_| ExprError::Syntax(format!("invalid number '{}' at position {}", text, pos)))
    } else {
        text.parse::<i64>()
            .map(|n| (Tok::Int(n), i))
            .map_err(|_| ExprError::Syntax(format!("integer literal too large at position {}", pos)))
    }
}

fn lex_string(chars: &[(usize, char)], start: usize) -> Result<(String, usize), ExprError> {
    let quote = chars[start].1;
    let mut out = String::new();
    let mut i = start + 1;

    while let Some(&(_, c)) = chars.get(i) {
        if c == quote {
            return Ok((out, i + 1));
        }
        if c == '\n' {
            break;
        }
        if c == '\\' {
            i += 1;
            let Some(&(_, esc)) = chars.get(i) else {
                break;
            };
            match esc {
                'n' => out.push('\n'),
                't' => out.push('\t'),
                'r' => out.push('\r'),
                '0' => out.push('\0'),
                '\\' => out.push('\\'),
                '\'' => out.push('\''),
                '"' => out.push('"'),
                other => {
                    out.push('\\');
                    out.push(other);
                }
            }
        } else {
            out.push(c);
        }
        i += 1;
    }

    Err(ExprError::Syntax(format!(
        "unterminated string starting at position {}",
        chars[start].0
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        tokenize(src).unwrap().into_iter().map(|s| s.tok).collect()
    }

    #[test]
    fn numbers() {
        assert_eq!(toks("42 3.5 .5 1e3 1_000"), vec![
            Tok::Int(42),
            Tok::Float(3.5),
            Tok::Float(0.5),
            Tok::Float(1000.0),
            Tok::Int(1000),
            Tok::Eof,
        ]);
    }

    #[test]
    fn method_call_on_int_literal_is_not_a_float() {
        assert_eq!(toks("x.get"), vec![
            Tok::Name("x".into()),
            Tok::Dot,
            Tok::Name("get".into()),
            Tok::Eof,
        ]);
    }

    #[test]
    fn strings_and_escapes() {
        assert_eq!(toks(r#"'a\'b' "c\n""#), vec![
            Tok::Str("a'b".into()),
            Tok::Str("c\n".into()),
            Tok::Eof,
        ]);
    }

    #[test]
    fn keywords_and_operators() {
        assert_eq!(toks("not x is None // 2 ** 3"), vec![
            Tok::Not,
            Tok::Name("x".into()),
            Tok::Is,
            Tok::None,
            Tok::DoubleSlash,
            Tok::Int(2),
            Tok::DoubleStar,
            Tok::Int(3),
            Tok::Eof,
        ]);
    }

    #[test]
    fn rejects_unknown_characters() {
        assert!(matches!(tokenize("a @ b"), Err(ExprError::Syntax(_))));
        assert!(matches!(tokenize("x;"), Err(ExprError::Syntax(_))));
    }
}
