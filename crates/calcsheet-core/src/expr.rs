//! Arithmetic expressions for worksheet calculations.
//!
//! Calculation elements carry an [`Expr`] tree parsed from the worksheet
//! text. The grammar is deliberately small: numbers, identifiers, the four
//! arithmetic operators, exponentiation, unary minus, parentheses, and a
//! fixed set of math functions.

use std::collections::BTreeSet;
use std::fmt;

use thiserror::Error;

/// Binary operators, in increasing precedence order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinOp {
    /// Symbol as written in worksheet text.
    pub fn symbol(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Pow => "^",
        }
    }
}

/// Math functions callable from a calculation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MathFn {
    Sqrt,
    Sin,
    Cos,
    Ln,
    Exp,
    Abs,
}

impl MathFn {
    /// Look up a function by its worksheet name.
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "sqrt" => Some(MathFn::Sqrt),
            "sin" => Some(MathFn::Sin),
            "cos" => Some(MathFn::Cos),
            "ln" => Some(MathFn::Ln),
            "exp" => Some(MathFn::Exp),
            "abs" => Some(MathFn::Abs),
            _ => None,
        }
    }

    /// Worksheet-facing name.
    pub fn name(&self) -> &'static str {
        match self {
            MathFn::Sqrt => "sqrt",
            MathFn::Sin => "sin",
            MathFn::Cos => "cos",
            MathFn::Ln => "ln",
            MathFn::Exp => "exp",
            MathFn::Abs => "abs",
        }
    }
}

/// An expression tree.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Numeric literal.
    Number(f64),
    /// Reference to an identifier defined by an earlier calculation.
    Ident(String),
    /// Unary negation.
    Neg(Box<Expr>),
    /// Binary operation.
    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    /// Call of a built-in math function.
    Call { func: MathFn, arg: Box<Expr> },
}

impl Expr {
    /// Collect every identifier referenced anywhere in the tree.
    pub fn identifiers(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_identifiers(&mut out);
        out
    }

    fn collect_identifiers(&self, out: &mut BTreeSet<String>) {
        match self {
            Expr::Number(_) => {}
            Expr::Ident(name) => {
                out.insert(name.clone());
            }
            Expr::Neg(inner) => inner.collect_identifiers(out),
            Expr::Binary { lhs, rhs, .. } => {
                lhs.collect_identifiers(out);
                rhs.collect_identifiers(out);
            }
            Expr::Call { arg, .. } => arg.collect_identifiers(out),
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", n),
            Expr::Ident(name) => write!(f, "{}", name),
            Expr::Neg(inner) => write!(f, "-({})", inner),
            Expr::Binary { op, lhs, rhs } => {
                write!(f, "({} {} {})", lhs, op.symbol(), rhs)
            }
            Expr::Call { func, arg } => write!(f, "{}({})", func.name(), arg),
        }
    }
}

/// Errors produced while parsing an expression.
#[derive(Error, Debug, PartialEq)]
pub enum ParseError {
    /// An unexpected character in the input.
    #[error("Unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    /// Input ended in the middle of an expression.
    #[error("Unexpected end of expression")]
    UnexpectedEnd,

    /// A closing parenthesis is missing.
    #[error("Expected ')' at offset {0}")]
    ExpectedClose(usize),

    /// A name was called like a function but is not one we know.
    #[error("Unknown function '{0}'")]
    UnknownFunction(String),

    /// A numeric literal failed to parse.
    #[error("Invalid number '{0}'")]
    InvalidNumber(String),

    /// Trailing input after a complete expression.
    #[error("Trailing input at offset {0}")]
    TrailingInput(usize),
}

/// Parse an expression from worksheet text.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser::new(input);
    let expr = parser.expr()?;
    parser.skip_ws();
    if parser.pos < parser.chars.len() {
        return Err(ParseError::TrailingInput(parser.pos));
    }
    Ok(expr)
}

/// Recursive-descent parser over a char buffer.
///
/// Precedence climbing: addition < multiplication < exponentiation
/// (right-associative) < unary minus < atoms.
struct Parser {
    chars: Vec<char>,
    pos: usize,
}

impl Parser {
    fn new(input: &str) -> Self {
        Self {
            chars: input.chars().collect(),
            pos: 0,
        }
    }

    fn skip_ws(&mut self) {
        while self.pos < self.chars.len() && self.chars[self.pos].is_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_ws();
        self.chars.get(self.pos).copied()
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.term()?;
        while let Some(c) = self.peek() {
            let op = match c {
                '+' => BinOp::Add,
                '-' => BinOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.power()?;
        while let Some(c) = self.peek() {
            let op = match c {
                '*' => BinOp::Mul,
                '/' => BinOp::Div,
                _ => break,
            };
            self.pos += 1;
            let rhs = self.power()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        Ok(lhs)
    }

    fn power(&mut self) -> Result<Expr, ParseError> {
        let base = self.unary()?;
        if self.peek() == Some('^') {
            self.pos += 1;
            // Right-associative: a^b^c parses as a^(b^c).
            let exp = self.power()?;
            return Ok(Expr::Binary {
                op: BinOp::Pow,
                lhs: Box::new(base),
                rhs: Box::new(exp),
            });
        }
        Ok(base)
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some('-') {
            self.pos += 1;
            let inner = self.unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        let c = self.peek().ok_or(ParseError::UnexpectedEnd)?;
        if c == '(' {
            self.pos += 1;
            let inner = self.expr()?;
            if self.peek() != Some(')') {
                return Err(ParseError::ExpectedClose(self.pos));
            }
            self.pos += 1;
            return Ok(inner);
        }
        if c.is_ascii_digit() || c == '.' {
            return self.number();
        }
        if c.is_alphabetic() || c == '_' {
            return self.ident_or_call();
        }
        Err(ParseError::UnexpectedChar(c, self.pos))
    }

    fn number(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            if c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E' {
                self.pos += 1;
            } else if (c == '+' || c == '-')
                && self.pos > start
                && matches!(self.chars[self.pos - 1], 'e' | 'E')
            {
                self.pos += 1;
            } else {
                break;
            }
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(Expr::Number)
            .map_err(|_| ParseError::InvalidNumber(text))
    }

    fn ident_or_call(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        while self.pos < self.chars.len() {
            let c = self.chars[self.pos];
            if c.is_alphanumeric() || c == '_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        let name: String = self.chars[start..self.pos].iter().collect();
        if self.peek() == Some('(') {
            let func = MathFn::by_name(&name).ok_or(ParseError::UnknownFunction(name))?;
            self.pos += 1;
            let arg = self.expr()?;
            if self.peek() != Some(')') {
                return Err(ParseError::ExpectedClose(self.pos));
            }
            self.pos += 1;
            return Ok(Expr::Call {
                func,
                arg: Box::new(arg),
            });
        }
        Ok(Expr::Ident(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse("42").unwrap(), Expr::Number(42.0));
        assert_eq!(parse("3.25").unwrap(), Expr::Number(3.25));
        assert_eq!(parse("1e3").unwrap(), Expr::Number(1000.0));
    }

    #[test]
    fn test_parse_precedence() {
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary {
                op: BinOp::Add,
                lhs: Box::new(Expr::Number(1.0)),
                rhs: Box::new(Expr::Binary {
                    op: BinOp::Mul,
                    lhs: Box::new(Expr::Number(2.0)),
                    rhs: Box::new(Expr::Number(3.0)),
                }),
            }
        );
    }

    #[test]
    fn test_parse_power_right_assoc() {
        let expr = parse("2 ^ 3 ^ 2").unwrap();
        // 2^(3^2), not (2^3)^2
        match expr {
            Expr::Binary {
                op: BinOp::Pow,
                lhs,
                rhs,
            } => {
                assert_eq!(*lhs, Expr::Number(2.0));
                assert!(matches!(*rhs, Expr::Binary { op: BinOp::Pow, .. }));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn test_parse_call_and_identifiers() {
        let expr = parse("sqrt(v0 * v0 + 2 * g * h)").unwrap();
        let idents = expr.identifiers();
        assert_eq!(
            idents.into_iter().collect::<Vec<_>>(),
            vec!["g".to_string(), "h".to_string(), "v0".to_string()]
        );
    }

    #[test]
    fn test_parse_unary_minus() {
        let expr = parse("-x + 1").unwrap();
        assert!(matches!(
            expr,
            Expr::Binary {
                op: BinOp::Add,
                ..
            }
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse(""), Err(ParseError::UnexpectedEnd));
        assert!(matches!(parse("(1 + 2"), Err(ParseError::ExpectedClose(_))));
        assert_eq!(
            parse("foo(1)"),
            Err(ParseError::UnknownFunction("foo".to_string()))
        );
        assert!(matches!(parse("1 + 2 )"), Err(ParseError::TrailingInput(_))));
    }
}
