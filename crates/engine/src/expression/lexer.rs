//! Tokenizer for the form expression language.

use super::SyntaxError;

/// A lexical token.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    String(String),
    Identifier(String),
    True,
    False,
    Null,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Bang,
    EqualEqual,
    BangEqual,
    EqualEqualEqual,
    BangEqualEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    AndAnd,
    OrOr,
    Question,
    Colon,
    Dot,
    Comma,
    LeftParen,
    RightParen,
    LeftBracket,
    RightBracket,
    End,
}

/// A token with the byte offset where it starts.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedToken {
    pub token: Token,
    pub offset: usize,
}

/// Splits `source` into tokens, always ending with [`Token::End`].
pub fn tokenize(source: &str) -> Result<Vec<SpannedToken>, SyntaxError> {
    let mut tokens = Vec::new();
    let mut characters = source.char_indices().peekable();

    while let Some(&(offset, character)) = characters.peek() {
        if character.is_whitespace() {
            characters.next();
            continue;
        }

        let token = match character {
            '0'..='9' => lex_number(source, &mut characters)?,
            '"' | '\'' => lex_string(&mut characters)?,
            character if is_identifier_start(character) => lex_word(&mut characters),
            _ => {
                characters.next();
                let next = characters.peek().map(|&(_, next)| next);
                match (character, next) {
                    ('=', Some('=')) => {
                        characters.next();
                        if characters.next_if(|&(_, c)| c == '=').is_some() {
                            Token::EqualEqualEqual
                        } else {
                            Token::EqualEqual
                        }
                    }
                    ('!', Some('=')) => {
                        characters.next();
                        if characters.next_if(|&(_, c)| c == '=').is_some() {
                            Token::BangEqualEqual
                        } else {
                            Token::BangEqual
                        }
                    }
                    ('<', Some('=')) => {
                        characters.next();
                        Token::LessEqual
                    }
                    ('>', Some('=')) => {
                        characters.next();
                        Token::GreaterEqual
                    }
                    ('&', Some('&')) => {
                        characters.next();
                        Token::AndAnd
                    }
                    ('|', Some('|')) => {
                        characters.next();
                        Token::OrOr
                    }
                    ('+', _) => Token::Plus,
                    ('-', _) => Token::Minus,
                    ('*', _) => Token::Star,
                    ('/', _) => Token::Slash,
                    ('%', _) => Token::Percent,
                    ('!', _) => Token::Bang,
                    ('<', _) => Token::Less,
                    ('>', _) => Token::Greater,
                    ('?', _) => Token::Question,
                    (':', _) => Token::Colon,
                    ('.', _) => Token::Dot,
                    (',', _) => Token::Comma,
                    ('(', _) => Token::LeftParen,
                    (')', _) => Token::RightParen,
                    ('[', _) => Token::LeftBracket,
                    (']', _) => Token::RightBracket,
                    (other, _) => return Err(SyntaxError::new(format!("unexpected character '{other}'"), offset)),
                }
            }
        };
        tokens.push(SpannedToken { token, offset });
    }

    tokens.push(SpannedToken {
        token: Token::End,
        offset: source.len(),
    });
    Ok(tokens)
}

type Characters<'a> = std::iter::Peekable<std::str::CharIndices<'a>>;

fn is_identifier_start(character: char) -> bool {
    character.is_ascii_alphabetic() || character == '_' || character == '$'
}

fn is_identifier_continue(character: char) -> bool {
    character.is_ascii_alphanumeric() || character == '_' || character == '$'
}

fn lex_number(source: &str, characters: &mut Characters<'_>) -> Result<Token, SyntaxError> {
    let Some(&(start, _)) = characters.peek() else {
        return Err(SyntaxError::new("expected a number", source.len()));
    };
    let mut end = start;
    let mut seen_dot = false;
    while let Some(&(offset, character)) = characters.peek() {
        if character.is_ascii_digit() {
            end = offset + 1;
            characters.next();
        } else if character == '.' && !seen_dot {
            // `1.toString` is not a number; require a digit after the dot.
            let mut lookahead = characters.clone();
            lookahead.next();
            if !lookahead.peek().is_some_and(|&(_, next)| next.is_ascii_digit()) {
                break;
            }
            seen_dot = true;
            end = offset + 1;
            characters.next();
        } else {
            break;
        }
    }
    source[start..end]
        .parse::<f64>()
        .map(Token::Number)
        .map_err(|_| SyntaxError::new(format!("invalid number '{}'", &source[start..end]), start))
}

fn lex_string(characters: &mut Characters<'_>) -> Result<Token, SyntaxError> {
    let Some((start, quote)) = characters.next() else {
        return Err(SyntaxError::new("expected a string", 0));
    };
    let mut value = String::new();
    loop {
        match characters.next() {
            Some((_, character)) if character == quote => return Ok(Token::String(value)),
            Some((offset, '\\')) => match characters.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, escaped @ ('\\' | '"' | '\''))) => value.push(escaped),
                Some((_, other)) => return Err(SyntaxError::new(format!("unknown escape '\\{other}'"), offset)),
                None => return Err(SyntaxError::new("unterminated string", start)),
            },
            Some((_, character)) => value.push(character),
            None => return Err(SyntaxError::new("unterminated string", start)),
        }
    }
}

fn lex_word(characters: &mut Characters<'_>) -> Token {
    let mut word = String::new();
    while let Some((_, character)) = characters.next_if(|&(_, character)| is_identifier_continue(character)) {
        word.push(character);
    }
    match word.as_str() {
        "true" => Token::True,
        "false" => Token::False,
        "null" | "undefined" => Token::Null,
        _ => Token::Identifier(word),
    }
}
