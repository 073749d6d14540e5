/// A single matcher atom: an identifier applied to backtick-quoted
/// string arguments, e.g. ``Header(`X-Env`, `prod`)``.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matcher {
    /// The matcher identifier as written (`Host`, `PathPrefix`, ...).
    pub name: String,
    /// Arguments in declared order.
    pub args: Vec<String>,
}

/// The parsed rule tree.
///
/// `And`/`Or` are n-ary (the parser folds chains of the same operator into
/// one node); evaluation short-circuits left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleExpr {
    /// All children must match.
    And(Vec<RuleExpr>),
    /// At least one child must match.
    Or(Vec<RuleExpr>),
    /// The child must not match.
    Not(Box<RuleExpr>),
    /// A single matcher atom.
    Matcher(Matcher),
}

impl RuleExpr {
    /// Iterate over every atom in the tree.
    pub fn atoms(&self) -> Vec<&Matcher> {
        let mut out = Vec::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms<'a>(&'a self, out: &mut Vec<&'a Matcher>) {
        match self {
            Self::And(children) | Self::Or(children) => {
                for child in children {
                    child.collect_atoms(out);
                }
            }
            Self::Not(child) => child.collect_atoms(out),
            Self::Matcher(m) => out.push(m),
        }
    }
}
