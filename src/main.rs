use stress_test::{stress_test_fanout, stress_test_mesh, stress_test_scaling};
pub mod stress_test;

fn main() {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(async_main());
}

async fn async_main() {

    // Run async stress tests
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║            ASYNC STRESS TESTS                               ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    // Test 1: Fan-out with small scale
    let stats = stress_test_fanout(4, 200).await;
    stats.print();

    // Test 2: Mesh with small scale
    let stats = stress_test_mesh(4, 200).await;
    stats.print();

    // Test 3: Fan-out with medium scale
    let stats = stress_test_fanout(10, 1000).await;
    stats.print();

    // Test 4: Mesh with medium scale
    let stats = stress_test_mesh(10, 1000).await;
    stats.print();

    // Test 5: Scaling analysis
    println!("\n\n╔════════════════════════════════════════════════════════════╗");
    println!("║          SCALING ANALYSIS (Fan-Out)                        ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    stress_test_scaling(20, 2).await;

    println!("\n✓ All stress tests completed successfully!");
}
