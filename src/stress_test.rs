use async_stream::stream;
use futures::stream::Stream;
use futures::stream::StreamExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tether_core::{Endpoint, Key, Value};
use tether_reactive::CreateOptions;
use tether_runtime::{LoadContext, MemoryNetwork, MemoryStore, Runtime, RuntimeConfig};

/// Statistics collected during stress testing
#[derive(Clone, Debug)]
pub struct StressTestStats {
    pub num_endpoints: usize,
    pub writes_per_endpoint: usize,
    pub total_ticks: usize,
    pub total_time: Duration,
    pub avg_tick_time: Duration,
    pub writes_per_second: f64,
}

impl StressTestStats {
    pub fn print(&self) {
        println!("\n╔════════════════════════════════════════════════════════════╗");
        println!("║              Stress Test Statistics                         ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  Number of Endpoints:       {:>38} ║", self.num_endpoints);
        println!("║  Writes per Endpoint:       {:>38} ║", self.writes_per_endpoint);
        println!("║  Total Sync Ticks:          {:>38} ║", self.total_ticks);
        println!("║  Total Time:                {:>39}s ║", format!("{:.3}", self.total_time.as_secs_f64()));
        println!("║  Average Tick Time:         {:>36}µs ║", format!("{:.2}", self.avg_tick_time.as_micros()));
        println!("║  Writes/Second:             {:>38.0} ║", self.writes_per_second);
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

/// Generator that yields endpoint indices for write patterns
fn writer_generator(num_endpoints: usize, num_writes: usize) -> impl Stream<Item = (usize, i64)> {
    stream! {
        let mut rng = StdRng::from_entropy();
        for _ in 0..num_writes {
            let writer = rng.gen_range(0..num_endpoints);
            let value = rng.gen_range(0..1_000_000);
            yield (writer, value);
        }
    }
}

fn spawn_endpoint(network: &Arc<MemoryNetwork>, name: &str) -> Arc<Runtime> {
    let endpoint = Endpoint::new(name);
    let transport = Arc::new(network.transport(endpoint.clone()));
    let store = Arc::new(MemoryStore::new());
    let runtime = Runtime::new(transport, store, RuntimeConfig::new(endpoint.clone()));
    network.attach(&endpoint, runtime.sync().clone());
    runtime
}

/// Stress test for origin fan-out: one origin, many subscribers
pub async fn stress_test_fanout(num_subscribers: usize, num_writes: usize) -> StressTestStats {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Fan-Out Stress Test (Async)                         ║");
    println!("║  Subscribers: {} | Writes: {} ║", num_subscribers, num_writes);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let network = MemoryNetwork::new();

    let origin = spawn_endpoint(&network, "origin");
    let ptr = origin
        .space()
        .create(Value::Int(0), CreateOptions::default())
        .unwrap();
    origin.space().set_persistent(&ptr, true);

    println!("\n[Phase 1/2] Subscribing endpoints...");

    let mut subscribers = Vec::with_capacity(num_subscribers);
    for idx in 0..num_subscribers {
        let runtime = spawn_endpoint(&network, &format!("subscriber_{}", idx));
        let replica = runtime
            .sync()
            .load(ptr.id(), &LoadContext::new())
            .await
            .unwrap()
            .ready()
            .unwrap();
        runtime.space().set_persistent(&replica, true);
        subscribers.push((runtime, replica));

        if idx % 100 == 0 {
            tokio::task::yield_now().await;
        }
    }

    println!("[Phase 1/2] ✓ Completed");
    println!("[Phase 2/2] Writing and propagating...");

    let mut tick_times = vec![];
    let mut total_ticks = 0;
    for i in 0..num_writes {
        origin.space().replace(&ptr, Value::Int(i as i64)).unwrap();

        let tick_start = Instant::now();
        origin.tick(origin.now_ms()).await;
        tick_times.push(tick_start.elapsed());
        total_ticks += 1;

        if total_ticks % 100 == 0 {
            println!("  Ticks completed: {}/{}", total_ticks, num_writes);
            tokio::task::yield_now().await;
        }
    }

    // Every subscriber converged to the last written value
    let expected = Value::Int(num_writes as i64 - 1);
    for (runtime, replica) in &subscribers {
        assert_eq!(runtime.space().value(replica).unwrap(), expected);
    }

    let total_time = start.elapsed();
    let avg_tick_time = if !tick_times.is_empty() {
        tick_times.iter().sum::<Duration>() / tick_times.len() as u32
    } else {
        Duration::ZERO
    };
    let writes_per_second = num_writes as f64 / total_time.as_secs_f64();

    println!("[Phase 2/2] ✓ Completed");

    StressTestStats {
        num_endpoints: num_subscribers + 1,
        writes_per_endpoint: num_writes,
        total_ticks,
        total_time,
        avg_tick_time,
        writes_per_second,
    }
}

/// Stress test for a mesh: every endpoint owns a pointer, every other
/// endpoint subscribes, random writers mutate their own pointer
pub async fn stress_test_mesh(num_endpoints: usize, num_writes: usize) -> StressTestStats {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║        Mesh Stress Test (Async)                            ║");
    println!("║  Endpoints: {} | Writes: {} ║", num_endpoints, num_writes);
    println!("╚════════════════════════════════════════════════════════════╝");

    let start = Instant::now();
    let network = MemoryNetwork::new();

    println!("\n[Phase 1/2] Building the mesh...");

    let mut runtimes = Vec::with_capacity(num_endpoints);
    let mut pointers = Vec::with_capacity(num_endpoints);
    for idx in 0..num_endpoints {
        let runtime = spawn_endpoint(&network, &format!("endpoint_{}", idx));
        let ptr = runtime
            .space()
            .create(
                Value::Map(indexmap::IndexMap::from_iter([(
                    "writes".to_string(),
                    Value::Int(0),
                )])),
                CreateOptions::default(),
            )
            .unwrap();
        runtime.space().set_persistent(&ptr, true);
        runtimes.push(runtime);
        pointers.push(ptr);
    }
    for (idx, runtime) in runtimes.iter().enumerate() {
        for (owner, ptr) in pointers.iter().enumerate() {
            if owner == idx {
                continue;
            }
            let replica = runtime
                .sync()
                .load(ptr.id(), &LoadContext::new())
                .await
                .unwrap()
                .ready()
                .unwrap();
            runtime.space().set_persistent(&replica, true);
        }
    }

    println!("[Phase 1/2] ✓ Completed");
    println!("[Phase 2/2] Random writers mutating...");

    let mut tick_times = vec![];
    let mut total_ticks = 0;
    let mut write_gen = Box::pin(writer_generator(num_endpoints, num_writes));
    while let Some((writer, value)) = write_gen.next().await {
        let runtime = &runtimes[writer];
        runtime
            .space()
            .set(&pointers[writer], "writes", value)
            .unwrap();

        let tick_start = Instant::now();
        runtime.tick(runtime.now_ms()).await;
        tick_times.push(tick_start.elapsed());
        total_ticks += 1;

        if total_ticks % 100 == 0 {
            println!("  Ticks completed: {}/{}", total_ticks, num_writes);
            tokio::task::yield_now().await;
        }
    }

    // Every replica of every pointer converged to the owner's copy
    for (owner, ptr) in pointers.iter().enumerate() {
        let expected = runtimes[owner]
            .space()
            .get_property(ptr, &Key::from("writes"))
            .unwrap();
        for (idx, runtime) in runtimes.iter().enumerate() {
            if idx == owner {
                continue;
            }
            let replica = runtime.space().get(&ptr.id()).unwrap();
            assert_eq!(
                runtime
                    .space()
                    .get_property(&replica, &Key::from("writes"))
                    .unwrap(),
                expected
            );
        }
    }

    let total_time = start.elapsed();
    let avg_tick_time = if !tick_times.is_empty() {
        tick_times.iter().sum::<Duration>() / tick_times.len() as u32
    } else {
        Duration::ZERO
    };
    let writes_per_second = num_writes as f64 / total_time.as_secs_f64();

    println!("[Phase 2/2] ✓ Completed");

    StressTestStats {
        num_endpoints,
        writes_per_endpoint: num_writes / num_endpoints.max(1),
        total_ticks,
        total_time,
        avg_tick_time,
        writes_per_second,
    }
}

/// Parallel stress test comparing different fan-out scales
pub async fn stress_test_scaling(max_subscribers: usize, step_size: usize) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║      Scaling Analysis - Fan-Out vs Subscriber Count        ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let mut current_subscribers = step_size;
    while current_subscribers <= max_subscribers {
        let stats = stress_test_fanout(current_subscribers, 200).await;
        stats.print();
        current_subscribers += step_size;
    }
}
