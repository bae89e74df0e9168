//! Contract evaluation over resolved configurations.
//!
//! Each contract is a boolean expression whose variable roots are step
//! labels, bound to the steps' resolved config namespaces. Every contract is
//! evaluated; failures are aggregated so a single run reports them all.

use quiver_expr::{eval_bool, expression_roots, Env, EvalLimits};
use quiver_spec::Contract;
use quiver_types::{ContractFailure, QuiverError, Result};
use tracing::debug;

use crate::config::{config_env, ResolvedStep};

pub fn evaluate_contracts(
    contracts: &[Contract],
    resolved: &[ResolvedStep],
    limits: &EvalLimits,
) -> Result<()> {
    if contracts.is_empty() {
        return Ok(());
    }
    let env: Env = config_env(resolved);
    let mut failures = Vec::new();

    for contract in contracts {
        // A root naming no step is a wiring mistake, not a false contract.
        match expression_roots(&contract.expression) {
            Ok(roots) => {
                for root in &roots {
                    if !env.contains_key(root) {
                        return Err(QuiverError::ContractUndefinedLabel {
                            label: root.clone(),
                            expression: contract.expression.clone(),
                        });
                    }
                }
            }
            Err(err) => {
                failures.push(failure(contract, err.to_string()));
                continue;
            }
        }
        match eval_bool(&contract.expression, &env, limits) {
            Ok(true) => {}
            Ok(false) => failures.push(failure(contract, "evaluated to false".to_string())),
            Err(err) => failures.push(failure(contract, err.to_string())),
        }
    }

    debug!(
        contracts = contracts.len(),
        failed = failures.len(),
        "evaluated contracts"
    );
    if failures.is_empty() {
        Ok(())
    } else {
        Err(QuiverError::ContractViolations { failures })
    }
}

fn failure(contract: &Contract, detail: String) -> ContractFailure {
    ContractFailure {
        expression: contract.expression.clone(),
        message: contract.message.clone(),
        detail,
    }
}
