//! Predicate pushdown.
//!
//! A predicate whose inputs all come from one data pattern of its phase is
//! moved onto that pattern, so the matcher filters during the index scan
//! instead of the executor filtering after it. Predicates with inputs from
//! expressions, other patterns, or earlier phases stay where they are.

use crate::planner::Plan;
use crate::query::{Predicate, Var};

pub fn apply(plan: &mut Plan) -> usize {
    let mut moved = 0;
    for phase in &mut plan.phases {
        let mut kept = Vec::new();
        let predicates = std::mem::take(&mut phase.predicates);
        for pred in predicates {
            if !matches!(pred, Predicate::Compare { .. } | Predicate::Str { .. }) {
                kept.push(pred);
                continue;
            }
            let inputs = pred.input_vars();
            let target = phase.patterns.iter_mut().find(|p| {
                let vars = p.pattern.vars();
                !inputs.is_empty() && inputs.iter().all(|v: &Var| vars.contains(v))
            });
            match target {
                Some(pattern) => {
                    pattern.pushed.push(pred);
                    moved += 1;
                }
                None => kept.push(pred),
            }
        }
        phase.predicates = kept;
    }
    moved
}
