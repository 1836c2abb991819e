//! Arithmetic expressions for the `math` directive
//!
//! Attributes are referenced as `${name}`. Each reference is bound to a
//! generated variable and the rest of the formula is handed to `evalexpr`,
//! so the usual operators, parentheses and precedence apply.
//!
//! Formulas are compiled once when the pipeline is built and evaluated
//! against every sample.

use evalexpr::{ContextWithMutableVariables, EvalexprError, HashMapContext, Node, Value};
use once_cell::sync::OnceCell;
use regex::Regex;

use crate::error::ComputeError;

use super::sample::{value_as_f64, Sample};

static ATTRIBUTE_RE: OnceCell<Regex> = OnceCell::new();

fn attribute_regex() -> &'static Regex {
    ATTRIBUTE_RE
        .get_or_init(|| Regex::new(r"\$\{([^}]*)\}").expect("invalid attribute reference regex"))
}

/// A compiled `math` formula
#[derive(Debug, Clone)]
pub struct Expr {
    tree: Node,
    /// (generated identifier, attribute name), in order of first reference
    bindings: Vec<(String, String)>,
}

impl Expr {
    /// Compile a formula
    ///
    /// # Errors
    /// Returns a human-readable reason when the formula is malformed.
    pub fn parse(source: &str) -> Result<Expr, String> {
        if source.trim().is_empty() {
            return Err("empty expression".to_string());
        }

        let mut bindings: Vec<(String, String)> = Vec::new();
        for caps in attribute_regex().captures_iter(source) {
            let name = caps[1].trim();
            if name.is_empty() {
                return Err("empty attribute reference".to_string());
            }
            if !bindings.iter().any(|(_, attr)| attr == name) {
                bindings.push((format!("__attr{}", bindings.len()), name.to_string()));
            }
        }

        let rewritten = attribute_regex()
            .replace_all(source, |caps: &regex::Captures<'_>| {
                let name = caps[1].trim();
                bindings
                    .iter()
                    .find(|(_, attr)| attr == name)
                    .map(|(ident, _)| format!(" {} ", ident))
                    .unwrap_or_default()
            })
            .into_owned();
        if rewritten.contains('$') {
            return Err("unterminated attribute reference".to_string());
        }

        let tree = evalexpr::build_operator_tree(&rewritten).map_err(|e| e.to_string())?;
        if let Some(bare) = tree
            .iter_variable_identifiers()
            .find(|ident| !bindings.iter().any(|(bound, _)| bound == ident))
        {
            return Err(format!("unknown identifier '{}', attributes are written as ${{{}}}", bare, bare));
        }

        Ok(Expr { tree, bindings })
    }

    /// Attributes referenced by the formula
    pub fn attributes(&self) -> Vec<&str> {
        self.bindings.iter().map(|(_, attr)| attr.as_str()).collect()
    }

    /// Evaluate against a sample
    pub fn eval(&self, sample: &Sample) -> Result<f64, ComputeError> {
        let mut ctx = HashMapContext::new();
        for (ident, attr) in &self.bindings {
            let raw = sample
                .get(attr)
                .ok_or_else(|| ComputeError::UnknownAttribute(attr.clone()))?;
            let value = value_as_f64(raw).ok_or_else(|| ComputeError::NonNumeric(attr.clone()))?;
            ctx.set_value(ident.clone(), Value::Float(value))
                .map_err(|e| ComputeError::Evaluation(e.to_string()))?;
        }

        let value = self.tree.eval_number_with_context(&ctx).map_err(|e| match e {
            EvalexprError::DivisionError { .. } | EvalexprError::ModulationError { .. } => {
                ComputeError::DivisionByZero
            }
            other => ComputeError::Evaluation(other.to_string()),
        })?;

        if value.is_finite() {
            Ok(value)
        } else {
            Err(ComputeError::NonFinite)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Sample {
        let mut s = Sample::new("TestSample");
        s.set("used", 30);
        s.set("total", "120");
        s.set("name", "disk");
        s
    }

    #[test]
    fn test_precedence_and_parens() {
        let expr = Expr::parse("${used} / ${total} * 100").unwrap();
        assert_eq!(expr.eval(&sample()).unwrap(), 25.0);

        let expr = Expr::parse("(${total} - ${used}) * 2").unwrap();
        assert_eq!(expr.eval(&sample()).unwrap(), 180.0);

        let expr = Expr::parse("-${used} + 100.0 % 7").unwrap();
        assert_eq!(expr.eval(&sample()).unwrap(), -28.0);
    }

    #[test]
    fn test_adjacent_references() {
        let expr = Expr::parse("${used}*${used}").unwrap();
        assert_eq!(expr.eval(&sample()).unwrap(), 900.0);
    }

    #[test]
    fn test_attributes_listed() {
        let expr = Expr::parse("${a} + ${b} * 2 - ${a}").unwrap();
        assert_eq!(expr.attributes(), vec!["a", "b"]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("${}").is_err());
        assert!(Expr::parse("${used").is_err());
        assert!(Expr::parse("(1 + 2").is_err());
        assert!(Expr::parse("1 +").is_err());
        assert!(Expr::parse("used * 2").is_err());
    }

    #[test]
    fn test_eval_errors() {
        let s = sample();
        assert_eq!(
            Expr::parse("${missing} + 1").unwrap().eval(&s),
            Err(ComputeError::UnknownAttribute("missing".into()))
        );
        assert_eq!(
            Expr::parse("${name} + 1").unwrap().eval(&s),
            Err(ComputeError::NonNumeric("name".into()))
        );
        assert_eq!(
            Expr::parse("${used} / 0").unwrap().eval(&s),
            Err(ComputeError::NonFinite)
        );
        assert_eq!(
            Expr::parse("${used} + 1 / 0").unwrap().eval(&s),
            Err(ComputeError::DivisionByZero)
        );
    }
}
