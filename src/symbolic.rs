//! Parser for the operand-pattern mini-grammar used by symbolic tensor
//! operations and symbolic network construction:
//!
//! ```text
//! OUT(i1,i2,...)[+]=IN1(...)[*IN2(...)*...]
//! ```
//!
//! Index labels are lowercase identifiers; a trailing `+` after a tensor's
//! index list marks complex conjugation. A label shared between tensors
//! denotes a shared dimension. `+=` requests accumulation into the output.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::{Error, Result};
use crate::types::IndexKind;

/// One tensor factor of a parsed pattern: name, ordered index labels and the
/// conjugation marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternFactor {
    pub name: String,
    pub indices: Vec<String>,
    pub conjugated: bool,
}

impl PatternFactor {
    pub fn rank(&self) -> usize {
        self.indices.len()
    }

    /// Position of `label` among this factor's indices, if present.
    pub fn position(&self, label: &str) -> Option<usize> {
        self.indices.iter().position(|l| l == label)
    }
}

/// A fully parsed operand pattern: the output factor, the accumulation flag
/// and one or more input factors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexPattern {
    pub output: PatternFactor,
    pub accumulative: bool,
    pub inputs: Vec<PatternFactor>,
}

impl IndexPattern {
    /// Parses `OUT(..)[+]=IN1(..)[*IN2(..)*...]`.
    pub fn parse(pattern: &str) -> Result<Self> {
        let compact: String = pattern.chars().filter(|c| !c.is_whitespace()).collect();
        let err = |reason: &str| Error::Pattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let eq = compact.find('=').ok_or_else(|| err("missing `=`"))?;
        let (mut lhs, rhs) = (&compact[..eq], &compact[eq + 1..]);
        let accumulative = lhs.ends_with('+');
        if accumulative {
            lhs = &lhs[..lhs.len() - 1];
        }
        if rhs.is_empty() {
            return Err(err("empty right-hand side"));
        }

        let output = parse_factor(lhs).map_err(|reason| err(&reason))?;
        if output.conjugated {
            return Err(err("output tensor cannot be conjugated"));
        }

        let inputs = split_factors(rhs)
            .into_iter()
            .map(|f| parse_factor(&f))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|reason| err(&reason))?;

        let parsed = Self {
            output,
            accumulative,
            inputs,
        };
        parsed.validate().map_err(|reason| err(&reason))?;
        Ok(parsed)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        for factor in std::iter::once(&self.output).chain(self.inputs.iter()) {
            let mut seen = FxHashSet::default();
            for label in &factor.indices {
                if !seen.insert(label) {
                    return Err(format!(
                        "index `{label}` repeated within tensor `{}`",
                        factor.name
                    ));
                }
            }
        }
        // Every output label must come from some input.
        for label in &self.output.indices {
            if !self.inputs.iter().any(|f| f.position(label).is_some()) {
                return Err(format!("output index `{label}` missing from inputs"));
            }
        }
        Ok(())
    }

    /// Classifies every index label of a binary pattern `D = L * R` per
    /// [`IndexKind`]. Errors for patterns with other than two inputs.
    pub fn classify(&self) -> Result<FxHashMap<String, IndexKind>> {
        if self.inputs.len() != 2 {
            return Err(Error::Pattern {
                pattern: self.to_string(),
                reason: format!("expected 2 inputs, found {}", self.inputs.len()),
            });
        }
        let (left, right) = (&self.inputs[0], &self.inputs[1]);
        let mut kinds = FxHashMap::default();
        let all: FxHashSet<&String> = self
            .output
            .indices
            .iter()
            .chain(left.indices.iter())
            .chain(right.indices.iter())
            .collect();
        for label in all {
            let in_d = self.output.position(label).is_some();
            let in_l = left.position(label).is_some();
            let in_r = right.position(label).is_some();
            let kind = match (in_d, in_l, in_r) {
                (true, true, true) => IndexKind::Hyper,
                (true, true, false) => IndexKind::Left,
                (true, false, true) => IndexKind::Right,
                (false, true, true) => IndexKind::Contracted,
                (true, false, false) => IndexKind::DestTrace,
                (false, true, false) => IndexKind::LeftTrace,
                (false, false, true) => IndexKind::RightTrace,
                (false, false, false) => unreachable!(),
            };
            kinds.insert(label.clone(), kind);
        }
        Ok(kinds)
    }

    /// Labels contracted away by a binary pattern.
    pub fn contracted_labels(&self) -> Result<Vec<String>> {
        let kinds = self.classify()?;
        let mut labels: Vec<String> = kinds
            .into_iter()
            .filter(|(_, kind)| *kind == IndexKind::Contracted)
            .map(|(label, _)| label)
            .collect();
        labels.sort();
        Ok(labels)
    }

    /// Checks the label rules of a tensor addition: both operands must carry
    /// the same label set, modulo permutation.
    pub fn check_addition(&self) -> Result<()> {
        if self.inputs.len() != 1 {
            return Err(Error::Pattern {
                pattern: self.to_string(),
                reason: format!("addition takes 1 input, found {}", self.inputs.len()),
            });
        }
        let mut lhs: Vec<&String> = self.output.indices.iter().collect();
        let mut rhs: Vec<&String> = self.inputs[0].indices.iter().collect();
        lhs.sort();
        rhs.sort();
        if lhs != rhs {
            return Err(Error::Pattern {
                pattern: self.to_string(),
                reason: "addition operands must share the same index set".to_string(),
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for IndexPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({})",
            self.output.name,
            self.output.indices.join(",")
        )?;
        write!(f, "{}=", if self.accumulative { "+" } else { "" })?;
        for (i, factor) in self.inputs.iter().enumerate() {
            if i > 0 {
                write!(f, "*")?;
            }
            write!(f, "{}({})", factor.name, factor.indices.join(","))?;
            if factor.conjugated {
                write!(f, "+")?;
            }
        }
        Ok(())
    }
}

/// Splits the right-hand side on `*`, keeping parenthesized index lists
/// intact.
fn split_factors(rhs: &str) -> Vec<String> {
    let mut factors = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in rhs.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            '*' if depth == 0 => {
                factors.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        factors.push(current);
    }
    factors
}

/// Parses a single `Name(i,j,k)` factor with an optional trailing `+`.
fn parse_factor(text: &str) -> std::result::Result<PatternFactor, String> {
    let mut text = text;
    let mut conjugated = false;
    if let Some(stripped) = text.strip_suffix('+') {
        conjugated = true;
        text = stripped;
    }
    let open = text
        .find('(')
        .ok_or_else(|| format!("factor `{text}` lacks an index list"))?;
    if !text.ends_with(')') {
        return Err(format!("factor `{text}` lacks a closing parenthesis"));
    }
    let name = &text[..open];
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(format!("invalid tensor name `{name}`"));
    }
    let body = &text[open + 1..text.len() - 1];
    let indices = if body.is_empty() {
        Vec::new()
    } else {
        body.split(',')
            .map(|label| {
                if label.is_empty()
                    || !label
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
                {
                    Err(format!("invalid index label `{label}`"))
                } else {
                    Ok(label.to_string())
                }
            })
            .collect::<std::result::Result<Vec<_>, _>>()?
    };
    Ok(PatternFactor {
        name: name.to_string(),
        indices,
        conjugated,
    })
}
