//! Pratt parser producing an immutable expression tree.

use serde_json::Value;

use super::SyntaxError;
use super::lexer::{SpannedToken, Token, tokenize};

/// Parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Array(Vec<Expr>),
    Identifier(String),
    Member {
        object: Box<Expr>,
        property: String,
    },
    Index {
        object: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        arguments: Vec<Expr>,
    },
    Unary {
        operator: UnaryOperator,
        operand: Box<Expr>,
    },
    Binary {
        operator: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        operator: LogicalOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then_branch: Box<Expr>,
        else_branch: Box<Expr>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    Not,
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl BinaryOperator {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Remainder => "%",
            Self::Equal => "==",
            Self::NotEqual => "!=",
            Self::Less => "<",
            Self::LessEqual => "<=",
            Self::Greater => ">",
            Self::GreaterEqual => ">=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOperator {
    And,
    Or,
}

// Binding powers, loosest first.
const CONDITIONAL: u8 = 1;
const OR: u8 = 2;
const AND: u8 = 3;
const EQUALITY: u8 = 4;
const COMPARISON: u8 = 5;
const ADDITIVE: u8 = 6;
const MULTIPLICATIVE: u8 = 7;
const PREFIX: u8 = 8;
const POSTFIX: u8 = 9;

/// Deepest nesting the parser accepts before giving up.
pub const MAX_NESTING_DEPTH: usize = 256;

/// Parses a complete expression.
pub fn parse(source: &str) -> Result<Expr, SyntaxError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        position: 0,
        depth: 0,
    };
    let expression = parser.expression(0)?;
    match parser.peek() {
        Token::End => Ok(expression),
        other => Err(SyntaxError::new(format!("unexpected {other:?} after expression"), parser.offset())),
    }
}

struct Parser {
    tokens: Vec<SpannedToken>,
    position: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        self.tokens.get(self.position).map_or(&Token::End, |spanned| &spanned.token)
    }

    fn offset(&self) -> usize {
        self.tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map_or(0, |spanned| spanned.offset)
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if self.position < self.tokens.len() {
            self.position += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), SyntaxError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(SyntaxError::new(format!("expected {what}"), self.offset()))
        }
    }

    fn expression(&mut self, minimum_power: u8) -> Result<Expr, SyntaxError> {
        let depth = self.depth;
        let expression = self.operator_chain(minimum_power);
        self.depth = depth;
        expression
    }

    // Operands and chained operators both count towards the depth, which also
    // bounds the depth of the resulting tree.
    fn operator_chain(&mut self, minimum_power: u8) -> Result<Expr, SyntaxError> {
        self.descend()?;
        let mut left = self.prefix()?;

        loop {
            let Some(power) = infix_power(self.peek()) else {
                break;
            };
            if power < minimum_power || (power == minimum_power && power != CONDITIONAL) {
                break;
            }
            self.descend()?;
            left = self.infix(left, power)?;
        }
        Ok(left)
    }

    fn descend(&mut self) -> Result<(), SyntaxError> {
        self.depth += 1;
        if self.depth > MAX_NESTING_DEPTH {
            return Err(SyntaxError::new("expression nested too deeply", self.offset()));
        }
        Ok(())
    }

    fn prefix(&mut self) -> Result<Expr, SyntaxError> {
        let offset = self.offset();
        match self.advance() {
            Token::Number(number) => number_literal(number)
                .map(Expr::Literal)
                .ok_or_else(|| SyntaxError::new("number literal out of range", offset)),
            Token::String(text) => Ok(Expr::Literal(Value::String(text))),
            Token::True => Ok(Expr::Literal(Value::Bool(true))),
            Token::False => Ok(Expr::Literal(Value::Bool(false))),
            Token::Null => Ok(Expr::Literal(Value::Null)),
            Token::Identifier(name) => Ok(Expr::Identifier(name)),
            Token::Bang => Ok(Expr::Unary {
                operator: UnaryOperator::Not,
                operand: Box::new(self.expression(PREFIX)?),
            }),
            Token::Minus => Ok(Expr::Unary {
                operator: UnaryOperator::Negate,
                operand: Box::new(self.expression(PREFIX)?),
            }),
            Token::Plus => self.expression(PREFIX),
            Token::LeftParen => {
                let inner = self.expression(0)?;
                self.expect(Token::RightParen, "')'")?;
                Ok(inner)
            }
            Token::LeftBracket => {
                let items = self.list(Token::RightBracket, "']'")?;
                Ok(Expr::Array(items))
            }
            Token::End => Err(SyntaxError::new("unexpected end of expression", offset)),
            other => Err(SyntaxError::new(format!("unexpected {other:?}"), offset)),
        }
    }

    fn infix(&mut self, left: Expr, power: u8) -> Result<Expr, SyntaxError> {
        let offset = self.offset();
        let token = self.advance();
        let expression = match token {
            Token::Dot => match self.advance() {
                Token::Identifier(property) => Expr::Member {
                    object: Box::new(left),
                    property,
                },
                _ => return Err(SyntaxError::new("expected a property name after '.'", offset)),
            },
            Token::LeftBracket => {
                let index = self.expression(0)?;
                self.expect(Token::RightBracket, "']'")?;
                Expr::Index {
                    object: Box::new(left),
                    index: Box::new(index),
                }
            }
            Token::LeftParen => Expr::Call {
                callee: Box::new(left),
                arguments: self.list(Token::RightParen, "')'")?,
            },
            Token::Question => {
                let then_branch = self.expression(0)?;
                self.expect(Token::Colon, "':' in conditional expression")?;
                let else_branch = self.expression(CONDITIONAL)?;
                Expr::Conditional {
                    condition: Box::new(left),
                    then_branch: Box::new(then_branch),
                    else_branch: Box::new(else_branch),
                }
            }
            Token::AndAnd | Token::OrOr => {
                let operator = if token == Token::AndAnd {
                    LogicalOperator::And
                } else {
                    LogicalOperator::Or
                };
                Expr::Logical {
                    operator,
                    left: Box::new(left),
                    right: Box::new(self.expression(power)?),
                }
            }
            other => {
                let Some(operator) = binary_operator(&other) else {
                    return Err(SyntaxError::new(format!("unexpected {other:?}"), offset));
                };
                Expr::Binary {
                    operator,
                    left: Box::new(left),
                    right: Box::new(self.expression(power)?),
                }
            }
        };
        Ok(expression)
    }

    fn list(&mut self, closing: Token, what: &str) -> Result<Vec<Expr>, SyntaxError> {
        let mut items = Vec::new();
        if *self.peek() == closing {
            self.advance();
            return Ok(items);
        }
        loop {
            items.push(self.expression(0)?);
            if *self.peek() == Token::Comma {
                self.advance();
                continue;
            }
            self.expect(closing, what)?;
            return Ok(items);
        }
    }
}

fn infix_power(token: &Token) -> Option<u8> {
    let power = match token {
        Token::Question => CONDITIONAL,
        Token::OrOr => OR,
        Token::AndAnd => AND,
        Token::EqualEqual | Token::BangEqual | Token::EqualEqualEqual | Token::BangEqualEqual => EQUALITY,
        Token::Less | Token::LessEqual | Token::Greater | Token::GreaterEqual => COMPARISON,
        Token::Plus | Token::Minus => ADDITIVE,
        Token::Star | Token::Slash | Token::Percent => MULTIPLICATIVE,
        Token::Dot | Token::LeftBracket | Token::LeftParen => POSTFIX,
        _ => return None,
    };
    Some(power)
}

fn binary_operator(token: &Token) -> Option<BinaryOperator> {
    let operator = match token {
        Token::Plus => BinaryOperator::Add,
        Token::Minus => BinaryOperator::Subtract,
        Token::Star => BinaryOperator::Multiply,
        Token::Slash => BinaryOperator::Divide,
        Token::Percent => BinaryOperator::Remainder,
        Token::EqualEqual | Token::EqualEqualEqual => BinaryOperator::Equal,
        Token::BangEqual | Token::BangEqualEqual => BinaryOperator::NotEqual,
        Token::Less => BinaryOperator::Less,
        Token::LessEqual => BinaryOperator::LessEqual,
        Token::Greater => BinaryOperator::Greater,
        Token::GreaterEqual => BinaryOperator::GreaterEqual,
        _ => return None,
    };
    Some(operator)
}

/// Converts a number to JSON, keeping integral values as JSON integers.
///
/// Returns `None` for infinities and NaN, which JSON cannot represent.
pub(crate) fn number_literal(number: f64) -> Option<Value> {
    if number.is_finite() && number.fract() == 0.0 && number.abs() < 9.007_199_254_740_992e15 {
        Some(Value::from(number as i64))
    } else {
        serde_json::Number::from_f64(number).map(Value::Number)
    }
}
