//! Interface tests for tessera units using Cucumber.
//!
//! The feature files describe the public contract of a unit: dispatch,
//! concurrency strategies, failure isolation and lifecycle.
//!
//! ```bash
//! cargo test --test interfaces
//! ```

mod steps;

use cucumber::World;
use steps::units::UnitWorld;

#[tokio::main]
async fn main() {
    tessera::utils::bootstrap::try_init_tracing();

    println!("\n=== Running Dispatch Interface Tests ===\n");
    UnitWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/dispatch.feature")
        .await;

    println!("\n=== Running Strategy Interface Tests ===\n");
    UnitWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/strategies.feature")
        .await;

    println!("\n=== Running Failure Isolation Interface Tests ===\n");
    UnitWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/failures.feature")
        .await;

    println!("\n=== Running Lifecycle Interface Tests ===\n");
    UnitWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/lifecycle.feature")
        .await;
}
