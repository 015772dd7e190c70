//! Terminal output for experiment reports and probes

use colored::Colorize;
use scaler_lib::{
    AbortReason, DeploymentHealth, DeploymentResourceSpec, DeploymentTarget, ExperimentOutcome,
    ExperimentState, RollbackStatus,
};
use tabled::{settings::Style, Table, Tabled};

/// Row for the resources table
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Resource")]
    resource: &'static str,
    #[tabled(rename = "Request")]
    request: String,
    #[tabled(rename = "Limit")]
    limit: String,
}

fn resource_rows(spec: &DeploymentResourceSpec) -> Vec<ResourceRow> {
    vec![
        ResourceRow {
            resource: "cpu",
            request: spec.cpu_request.to_string(),
            limit: spec.cpu_limit.to_string(),
        },
        ResourceRow {
            resource: "memory",
            request: spec.memory_request.to_string(),
            limit: spec.memory_limit.to_string(),
        },
    ]
}

/// Render a resource spec as a table
pub fn resource_table(spec: &DeploymentResourceSpec) -> String {
    Table::new(resource_rows(spec)).with(Style::rounded()).to_string()
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Replica readiness, colored by health
pub fn format_health(health: &DeploymentHealth) -> String {
    let text = format!(
        "{}/{} replicas ready",
        health.ready_replicas, health.desired_replicas
    );
    if health.is_healthy() {
        text.green().to_string()
    } else {
        text.yellow().to_string()
    }
}

/// Print the result of `probe`
pub fn print_probe(
    target: &DeploymentTarget,
    fortio_run_id: i64,
    spec: &DeploymentResourceSpec,
    health: &DeploymentHealth,
) {
    print_success(&format!("Fortio reachable (probe run {})", fortio_run_id));
    print_success(&format!("Deployment {} reachable", target.to_string().cyan()));
    println!();
    println!("{}", resource_table(spec));
    println!("Health: {}", format_health(health));
}

/// Print the final experiment report
pub fn print_outcome(target: &DeploymentTarget, outcome: &ExperimentOutcome, state: &ExperimentState) {
    println!();
    println!("{}", "Vertical Scaling Experiment".bold());
    println!("{}", "=".repeat(60));
    println!("Deployment: {}", target.to_string().cyan());
    println!("Scale-ups:  {}", state.scale_ups);
    println!("Remediations: {}", state.remediations);
    println!();

    match outcome {
        ExperimentOutcome::Converged {
            best_qps,
            best_run_id,
            resources,
            cycles,
        } => {
            print_success(&format!(
                "Converged after {} cycles: best {:.1} QPS (run {})",
                cycles,
                best_qps,
                best_run_id.as_deref().unwrap_or("baseline")
            ));
            if let Some(resources) = resources {
                println!("{}", resource_table(resources));
            }
        }
        ExperimentOutcome::Aborted {
            reason,
            rollback,
            cycles,
        } => {
            let message = format!("Aborted after {} cycles: {}", cycles, reason);
            match reason {
                AbortReason::Cancelled => print_warning(&message),
                _ => print_error(&message),
            }
            print_info(&format!("Best observed: {:.1} QPS", state.best_qps));

            match rollback {
                RollbackStatus::NotNeeded => print_info("No resources were changed"),
                RollbackStatus::Restored(spec) => {
                    print_success("Restored starting resources");
                    println!("{}", resource_table(spec));
                }
                RollbackStatus::Failed(e) => {
                    print_error(&format!("Rollback failed: {}", e));
                    if let Some(starting) = &state.starting_resources {
                        print_warning("Starting resources were:");
                        println!("{}", resource_table(starting));
                    }
                }
            }
        }
    }
}
