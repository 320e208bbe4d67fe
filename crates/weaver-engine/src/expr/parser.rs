use serde_json::Value;

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::lexer::{tokenize, Spanned, Token};
use super::ExprError;

/// Longest condition source accepted.
pub const MAX_SOURCE_LEN: usize = 1024;
/// Deepest nesting of `!`, unary `-`, parentheses and index brackets.
pub const MAX_DEPTH: usize = 64;

/// Parse an expression into its AST.
pub fn parse(source: &str) -> Result<Expr, ExprError> {
    if source.len() > MAX_SOURCE_LEN {
        return Err(ExprError::TooLong {
            len: source.len(),
            max: MAX_SOURCE_LEN,
        });
    }
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens,
        cursor: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    parser.expect(Token::Eof, "end of expression")?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    cursor: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.cursor].token
    }

    fn advance(&mut self) -> Spanned {
        let spanned = self.tokens[self.cursor].clone();
        if self.cursor < self.tokens.len() - 1 {
            self.cursor += 1;
        }
        spanned
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == token {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: Token, expected: &'static str) -> Result<(), ExprError> {
        if self.eat(&token) {
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, ExprError>,
    ) -> Result<T, ExprError> {
        if self.depth >= MAX_DEPTH {
            return Err(ExprError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn unexpected(&self, expected: &'static str) -> ExprError {
        let spanned = &self.tokens[self.cursor];
        ExprError::UnexpectedToken {
            found: spanned.token.describe(),
            expected,
            pos: spanned.pos,
        }
    }

    fn or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::binary(BinaryOp::Or, left, right);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.not()?;
        while self.eat(&Token::And) {
            let right = self.not()?;
            left = Expr::binary(BinaryOp::And, left, right);
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Not) {
            let operand = self.nested(Self::not)?;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(operand)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, ExprError> {
        let left = self.additive()?;
        let op = match self.peek() {
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            _ => return Ok(left),
        };
        self.advance();
        let right = self.additive()?;
        Ok(Expr::binary(op, left, right))
    }

    fn additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.multiplicative()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Rem,
                _ => return Ok(left),
            };
            self.advance();
            let right = self.unary()?;
            left = Expr::binary(op, left, right);
        }
    }

    fn unary(&mut self) -> Result<Expr, ExprError> {
        if self.eat(&Token::Minus) {
            let operand = self.nested(Self::unary)?;
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(operand)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, ExprError> {
        let mut expr = self.primary()?;
        loop {
            if self.eat(&Token::Dot) {
                let Token::Ident(name) = self.peek().clone() else {
                    return Err(self.unexpected("field name"));
                };
                self.advance();
                expr = Expr::Member(Box::new(expr), name);
            } else if self.eat(&Token::LBracket) {
                let index = self.nested(Self::or)?;
                self.expect(Token::RBracket, "']'")?;
                expr = Expr::Index(Box::new(expr), Box::new(index));
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ExprError> {
        let expr = match self.peek().clone() {
            Token::Number(n) => Expr::Literal(number_value(n)),
            Token::Str(s) => Expr::Literal(Value::String(s)),
            Token::True => Expr::Literal(Value::Bool(true)),
            Token::False => Expr::Literal(Value::Bool(false)),
            Token::Null => Expr::Literal(Value::Null),
            Token::Ident(name) => Expr::Ident(name),
            Token::LParen => {
                self.advance();
                let inner = self.nested(Self::or)?;
                self.expect(Token::RParen, "')'")?;
                return Ok(inner);
            }
            _ => return Err(self.unexpected("a value")),
        };
        self.advance();
        Ok(expr)
    }
}

/// Integral values stay integers so they compare and print naturally.
pub(crate) fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn precedence() {
        let expr = parse("1 + 2 * 3 == 7 && !done").unwrap();
        let Expr::Binary(BinaryOp::And, left, right) = expr else {
            panic!("expected and at the root");
        };
        assert!(matches!(*left, Expr::Binary(BinaryOp::Eq, _, _)));
        assert!(matches!(*right, Expr::Unary(UnaryOp::Not, _)));
    }

    #[test]
    fn member_and_index_chain() {
        let expr = parse("output.files[0].path").unwrap();
        let roots = expr.root_identifiers();
        assert_eq!(roots.into_iter().collect::<Vec<_>>(), vec!["output"]);
    }

    #[test]
    fn parenthesized() {
        assert!(parse("(a || b) and c").is_ok());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let err = parse("a == 1 b").unwrap_err();
        assert!(matches!(err, ExprError::UnexpectedToken { pos: 7, .. }));
    }

    #[test]
    fn comparisons_do_not_chain() {
        assert!(parse("1 < 2 < 3").is_err());
    }

    #[test]
    fn nesting_is_bounded() {
        let ok = format!("{}true", "!".repeat(MAX_DEPTH));
        assert!(parse(&ok).is_ok());

        let deep = format!("{}true", "!".repeat(MAX_DEPTH + 1));
        assert_eq!(parse(&deep).unwrap_err(), ExprError::TooDeep(MAX_DEPTH));

        let parens = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(parse(&parens).unwrap_err(), ExprError::TooDeep(MAX_DEPTH));

        let negations = format!("{}1 == 1", "- ".repeat(100));
        assert_eq!(parse(&negations).unwrap_err(), ExprError::TooDeep(MAX_DEPTH));
    }

    #[test]
    fn oversized_source_is_rejected_before_parsing() {
        let huge = format!("{}true", "!".repeat(200_000));
        assert!(matches!(
            parse(&huge).unwrap_err(),
            ExprError::TooLong { len: 200_004, max: MAX_SOURCE_LEN }
        ));
    }

    #[test]
    fn missing_operand() {
        assert!(parse("a ==").is_err());
        assert!(parse("output.").is_err());
    }
}
