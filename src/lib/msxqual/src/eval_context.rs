//! Shared variable-resolution context for evaluating `Expr` trees against
//! the fixed namespace (species, terms, parameters, constants, then
//! hydraulic variables), in that order.

use crate::expr::{evaluate, Expr};
use crate::model::Term;
use std::cell::{Cell, RefCell};

pub struct VarContext<'a> {
    n_species: usize,
    terms: &'a [Term],
    term_memo: RefCell<Vec<Option<f64>>>,
    parameters: &'a [f64],
    constants: &'a [f64],
    hydraulic: &'a [f64; 9],
    species_c: RefCell<Vec<f64>>,
    math_error: Cell<bool>,
}

impl<'a> VarContext<'a> {
    pub fn new(
        n_species: usize,
        terms: &'a [Term],
        parameters: &'a [f64],
        constants: &'a [f64],
        hydraulic: &'a [f64; 9],
    ) -> Self {
        VarContext {
            n_species,
            terms,
            term_memo: RefCell::new(vec![None; terms.len()]),
            parameters,
            constants,
            hydraulic,
            species_c: RefCell::new(vec![0.0; n_species]),
            math_error: Cell::new(false),
        }
    }

    /// Rebind the species concentration vector for a new evaluation and
    /// clear the per-segment term memo cache.
    pub fn rebind(&self, species_c: &[f64]) {
        let mut dst = self.species_c.borrow_mut();
        dst.clear();
        dst.extend_from_slice(species_c);
        dst.resize(self.n_species, 0.0);
        self.term_memo.borrow_mut().iter_mut().for_each(|v| *v = None);
        self.math_error.set(false);
    }

    pub fn took_math_error(&self) -> bool {
        self.math_error.get()
    }

    pub fn value_of(&self, idx: usize) -> f64 {
        if idx == 0 {
            return 0.0;
        }
        let mut offset = idx - 1;
        if offset < self.n_species {
            return self.species_c.borrow().get(offset).copied().unwrap_or(0.0);
        }
        offset -= self.n_species;
        if offset < self.terms.len() {
            return self.term_value(offset);
        }
        offset -= self.terms.len();
        if offset < self.parameters.len() {
            return self.parameters[offset];
        }
        offset -= self.parameters.len();
        if offset < self.constants.len() {
            return self.constants[offset];
        }
        offset -= self.constants.len();
        self.hydraulic.get(offset).copied().unwrap_or(0.0)
    }

    fn term_value(&self, term_idx: usize) -> f64 {
        if let Some(v) = self.term_memo.borrow()[term_idx] {
            return v;
        }
        // Guard against evaluating a term whose cycle slipped past the
        // open-time check: seed the memo with 0 before recursing so a
        // re-entrant lookup terminates instead of overflowing the stack.
        self.term_memo.borrow_mut()[term_idx] = Some(0.0);
        let outcome = evaluate(&self.terms[term_idx].ir, &|i| self.value_of(i));
        if outcome.math_error {
            self.math_error.set(true);
        }
        self.term_memo.borrow_mut()[term_idx] = Some(outcome.value);
        outcome.value
    }

    pub fn eval(&self, expr: &Expr) -> f64 {
        let outcome = evaluate(expr, &|i| self.value_of(i));
        if outcome.math_error {
            self.math_error.set(true);
        }
        outcome.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::Parser;

    #[test]
    fn resolves_species_terms_parameters_constants_hydraulic() {
        let terms = vec![Term {
            name: "T1".into(),
            ir: Parser::parse("2", &|_| None).unwrap(),
        }];
        let params = [5.0];
        let consts = [7.0];
        let hyd = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let ctx = VarContext::new(1, &terms, &params, &consts, &hyd);
        ctx.rebind(&[10.0]);
        assert_eq!(ctx.value_of(1), 10.0); // species
        assert_eq!(ctx.value_of(2), 2.0); // term
        assert_eq!(ctx.value_of(3), 5.0); // parameter
        assert_eq!(ctx.value_of(4), 7.0); // constant
        assert_eq!(ctx.value_of(5), 1.0); // hydraulic D
    }
}
