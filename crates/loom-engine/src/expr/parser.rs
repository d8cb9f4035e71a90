use super::lexer::{Spanned, Tok};
use super::value::Value;
use super::ExprError;

/// Deepest nesting the parser will follow before giving up.
const MAX_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Pos,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

impl BinOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::FloorDiv => "//",
            BinOp::Mod => "%",
            BinOp::Pow => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
    Is,
    IsNot,
}

impl CmpOp {
    pub fn symbol(self) -> &'static str {
        match self {
            CmpOp::Eq => "==",
            CmpOp::NotEq => "!=",
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::In => "in",
            CmpOp::NotIn => "not in",
            CmpOp::Is => "is",
            CmpOp::IsNot => "is not",
        }
    }
}

/// Parsed condition expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Const(Value),
    Name(String),
    List(Vec<Expr>),
    Tuple(Vec<Expr>),
    Set(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Binary {
        op: BinOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `a < b <= c`: every link must hold; evaluation stops at the first false one.
    Compare {
        left: Box<Expr>,
        rest: Vec<(CmpOp, Expr)>,
    },
    IfElse {
        cond: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    Attribute {
        value: Box<Expr>,
        attr: String,
    },
    Subscript {
        value: Box<Expr>,
        index: Box<Expr>,
    },
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
    },
}

/// Recursive-descent parser over a token stream ending in `Eof`.
pub(crate) struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    depth: usize,
}

impl Parser {
    pub(crate) fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    pub(crate) fn parse(mut self) -> Result<Expr, ExprError> {
        let expr = self.expression()?;
        if self.peek() != &Tok::Eof {
            return Err(self.unexpected());
        }
        Ok(expr)
    }

    fn peek(&self) -> &Tok {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Tok {
        self.tokens
            .get(self.pos + offset)
            .or_else(|| self.tokens.last())
            .map(|s| &s.tok)
            .unwrap_or(&Tok::Eof)
    }

    fn advance(&mut self) -> Tok {
        let tok = self.peek().clone();
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        tok
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.peek() == tok {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: &Tok) -> Result<(), ExprError> {
        if self.eat(tok) {
            Ok(())
        } else {
            Err(self.unexpected())
        }
    }

    /// Error for the current token. Tokens that start a disallowed construct
    /// are reported as unsupported rather than as plain syntax errors.
    fn unexpected(&self) -> ExprError {
        let pos = self.tokens.get(self.pos).map(|s| s.pos).unwrap_or(0);
        match self.peek() {
            Tok::Assign => unsupported("assignment"),
            Tok::Walrus => unsupported("assignment expression"),
            Tok::Bitwise(_) => unsupported("bitwise operator"),
            Tok::Lambda => unsupported("lambda"),
            Tok::Eof => ExprError::Syntax("unexpected end of expression".to_string()),
            tok => ExprError::Syntax(format!("unexpected {} at position {}", tok.describe(), pos)),
        }
    }

    fn enter(&mut self) -> Result<(), ExprError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ExprError::Syntax("expression nested too deeply".to_string()));
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    /// expression := or_expr ['if' or_expr 'else' expression]
    fn expression(&mut self) -> Result<Expr, ExprError> {
        self.enter()?;
        let result = self.ternary();
        self.leave();
        result
    }

    fn ternary(&mut self) -> Result<Expr, ExprError> {
        let then = self.or_expr()?;
        if !self.eat(&Tok::If) {
            return Ok(then);
        }
        let cond = self.or_expr()?;
        self.expect(&Tok::Else)?;
        let otherwise = self.expression()?;
        Ok(Expr::IfElse {
            cond: Box::new(cond),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        })
    }

    fn or_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and_expr()?;
        while self.eat(&Tok::Or) {
            let right = self.and_expr()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and_expr(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.not_expr()?;
        while self.eat(&Tok::And) {
            let right = self.not_expr()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not_expr(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Tok::Not) {
            self.enter()?;
            let operand = self.not_expr();
            self.leave();
            return Ok(Expr::Unary {
                op: UnaryOp::Not,
                operand: Box::new(operand?),
            });
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match (self.peek(), self.peek_at(1)) {
                (Tok::EqEq, _) => CmpOp::Eq,
                (Tok::NotEq, _) => CmpOp::NotEq,
                (Tok::Lt, _) => CmpOp::Lt,
                (Tok::Le, _) => CmpOp::Le,
                (Tok::Gt, _) => CmpOp::Gt,
                (Tok::Ge, _) => CmpOp::Ge,
                (Tok::In, _) => CmpOp::In,
                (Tok::Not, Tok::In) => {
                    self.advance();
                    CmpOp::NotIn
                }
                (Tok::Is, Tok::Not) => {
                    self.advance();
                    CmpOp::IsNot
                }
                (Tok::Is, _) => CmpOp::Is,
                _ => break,
            };
            self.advance();
            rest.push((op, self.arith()?));
        }
        if rest.is_empty() {
            Ok(left)
        } else {
            Ok(Expr::Compare {
                left: Box::new(left),
                rest,
            })
        }
    }

    fn arith(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.term()?;
        loop {
            let op = match self.peek() {
                Tok::Plus => BinOp::Add,
                Tok::Minus => BinOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.term()?;
            left = binary(op, left, right);
        }
    }

    fn term(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Tok::Star => BinOp::Mul,
                Tok::Slash => BinOp::Div,
                Tok::DoubleSlash => BinOp::FloorDiv,
                Tok::Percent => BinOp::Mod,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek() {
            Tok::Minus => UnaryOp::Neg,
            Tok::Plus => UnaryOp::Pos,
            _ => return self.power(),
        };
        self.advance();
        self.enter()?;
        let operand = self.unary();
        self.leave();
        Ok(Expr::Unary {
            op,
            operand: Box::new(operand?),
        })
    }

    /// Right-associative, binds tighter than unary minus on its left.
    fn power(&mut self) -> Result<Expr, ExprError> {
        let base = self.postfix()?;
        if !self.eat(&Tok::DoubleStar) {
            return Ok(base);
        }
        self.enter()?;
        let exponent = self.unary();
        self.leave();
        Ok(binary(BinOp::Pow, base, exponent?))
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.atom()?;
        loop {
            match self.peek() {
                Tok::Dot => {
                    self.advance();
                    let Tok::Name(attr) = self.peek().clone() else {
                        return Err(self.unexpected());
                    };
                    self.advance();
                    expr = Expr::Attribute {
                        value: Box::new(expr),
                        attr,
                    };
                }
                Tok::LParen => {
                    self.advance();
                    let args = self.call_args()?;
                    expr = Expr::Call {
                        func: Box::new(expr),
                        args,
                    };
                }
                Tok::LBracket => {
                    self.advance();
                    let index = self.subscript()?;
                    expr = Expr::Subscript {
                        value: Box::new(expr),
                        index: Box::new(index),
                    };
                }
                _ => return Ok(expr),
            }
        }
    }

    fn call_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        let mut args = Vec::new();
        while self.peek() != &Tok::RParen {
            if matches!(self.peek(), Tok::Name(_)) && self.peek_at(1) == &Tok::Assign {
                return Err(unsupported("keyword argument"));
            }
            if matches!(self.peek(), Tok::Star | Tok::DoubleStar) {
                return Err(unsupported("argument unpacking"));
            }
            args.push(self.expression()?);
            if self.peek() == &Tok::For {
                return Err(unsupported("generator expression"));
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RParen)?;
        Ok(args)
    }

    fn subscript(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == &Tok::Colon {
            return Err(unsupported("slice"));
        }
        let first = self.expression()?;
        if self.peek() == &Tok::Colon {
            return Err(unsupported("slice"));
        }
        let index = if self.peek() == &Tok::Comma {
            let mut items = vec![first];
            while self.eat(&Tok::Comma) {
                if self.peek() == &Tok::RBracket {
                    break;
                }
                items.push(self.expression()?);
            }
            Expr::Tuple(items)
        } else {
            first
        };
        self.expect(&Tok::RBracket)?;
        Ok(index)
    }

    fn atom(&mut self) -> Result<Expr, ExprError> {
        let expr = match self.peek().clone() {
            Tok::Int(i) => Expr::Const(Value::Int(i)),
            Tok::Float(f) => Expr::Const(Value::Float(f)),
            Tok::Str(s) => {
                self.advance();
                // adjacent literals concatenate
                let mut s = s;
                while let Tok::Str(next) = self.peek() {
                    s.push_str(next);
                    self.advance();
                }
                return Ok(Expr::Const(Value::Str(s)));
            }
            Tok::True => Expr::Const(Value::Bool(true)),
            Tok::False => Expr::Const(Value::Bool(false)),
            Tok::None => Expr::Const(Value::None),
            Tok::Name(name) => Expr::Name(name),
            Tok::LParen => {
                self.advance();
                return self.paren();
            }
            Tok::LBracket => {
                self.advance();
                return self.list();
            }
            Tok::LBrace => {
                self.advance();
                return self.braces();
            }
            _ => return Err(self.unexpected()),
        };
        self.advance();
        Ok(expr)
    }

    /// `()` tuple, `(x)` grouping, `(x,)` / `(x, y)` tuple.
    fn paren(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Tok::RParen) {
            return Ok(Expr::Tuple(Vec::new()));
        }
        let first = self.expression()?;
        if self.peek() == &Tok::For {
            return Err(unsupported("generator expression"));
        }
        if self.eat(&Tok::RParen) {
            return Ok(first);
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if self.peek() == &Tok::RParen {
                break;
            }
            items.push(self.expression()?);
        }
        self.expect(&Tok::RParen)?;
        Ok(Expr::Tuple(items))
    }

    fn list(&mut self) -> Result<Expr, ExprError> {
        let mut items = Vec::new();
        while self.peek() != &Tok::RBracket {
            items.push(self.expression()?);
            if self.peek() == &Tok::For {
                return Err(unsupported("list comprehension"));
            }
            if !self.eat(&Tok::Comma) {
                break;
            }
        }
        self.expect(&Tok::RBracket)?;
        Ok(Expr::List(items))
    }

    /// `{}` is an empty dict; `{a: b}` a dict; `{a, b}` a set.
    fn braces(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Tok::RBrace) {
            return Ok(Expr::Dict(Vec::new()));
        }

        let first = self.expression()?;
        if self.eat(&Tok::Colon) {
            let value = self.expression()?;
            if self.peek() == &Tok::For {
                return Err(unsupported("dict comprehension"));
            }
            let mut pairs = vec![(first, value)];
            while self.eat(&Tok::Comma) {
                if self.peek() == &Tok::RBrace {
                    break;
                }
                let key = self.expression()?;
                self.expect(&Tok::Colon)?;
                pairs.push((key, self.expression()?));
            }
            self.expect(&Tok::RBrace)?;
            return Ok(Expr::Dict(pairs));
        }

        if self.peek() == &Tok::For {
            return Err(unsupported("set comprehension"));
        }
        let mut items = vec![first];
        while self.eat(&Tok::Comma) {
            if self.peek() == &Tok::RBrace {
                break;
            }
            items.push(self.expression()?);
        }
        self.expect(&Tok::RBrace)?;
        Ok(Expr::Set(items))
    }
}

fn binary(op: BinOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}

fn unsupported(what: &str) -> ExprError {
    ExprError::Unsupported(what.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::lexer::tokenize;

    fn parse(src: &str) -> Result<Expr, ExprError> {
        Parser::new(tokenize(src)?).parse()
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        let expr = parse("-2 ** 2").unwrap();
        assert!(matches!(
            expr,
            Expr::Unary {
                op: UnaryOp::Neg,
                ..
            }
        ));
    }

    #[test]
    fn power_is_right_associative() {
        let Expr::Binary { op, right, .. } = parse("2 ** 3 ** 2").unwrap() else {
            panic!("expected binary");
        };
        assert_eq!(op, BinOp::Pow);
        assert!(matches!(*right, Expr::Binary { op: BinOp::Pow, .. }));
    }

    #[test]
    fn not_in_and_is_not_are_single_operators() {
        let Expr::Compare { rest, .. } = parse("a not in b is not c").unwrap() else {
            panic!("expected comparison");
        };
        let ops: Vec<CmpOp> = rest.iter().map(|(op, _)| *op).collect();
        assert_eq!(ops, vec![CmpOp::NotIn, CmpOp::IsNot]);
    }

    #[test]
    fn grouping_is_not_a_tuple() {
        assert_eq!(parse("(1)").unwrap(), Expr::Const(Value::Int(1)));
        assert!(matches!(parse("(1,)").unwrap(), Expr::Tuple(items) if items.len() == 1));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let src = format!("{}1{}", "(".repeat(200), ")".repeat(200));
        assert!(matches!(parse(&src), Err(ExprError::Syntax(_))));
    }

    #[test]
    fn ternary_requires_else() {
        assert!(matches!(parse("1 if x"), Err(ExprError::Syntax(_))));
    }
}
