//! Serve a batch of requests from a bounded pool, then drain it.
//!
//! Run with `RUST_LOG=lspool=debug cargo run --example request_loop` to see
//! states being created, recycled and retired.

use std::sync::Arc;

use lspool::mlua::Lua;
use lspool::{Config, Context, InitHook, Manager, PoolEvent};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> lspool::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let hook: InitHook = Arc::new(|lua: &Lua| {
        let greet = lua.create_function(|_, name: String| Ok(format!("hello, {name}")))?;
        lua.globals().set("greet", greet)
    });

    let config = Config::from_json(
        r#"{ "max_num": 4, "start_num": 2, "max_request": 3, "idle_timeout": "10m" }"#,
    )?;
    let root = Context::background();
    let pool = Manager::new(&root, config, Some(hook))?;
    let mut events = pool.subscribe();

    let mut workers = Vec::new();
    for i in 0..8 {
        let pool = pool.clone();
        let ctx = root.child(format!("req-{i}"));
        workers.push(tokio::task::spawn_blocking(move || {
            pool.eval::<String>(&ctx, &format!("return greet('request {i}')"))
        }));
    }

    for worker in workers {
        match worker.await {
            Ok(Ok(reply)) => println!("{reply}"),
            Ok(Err(e)) if e.is_retryable() => println!("busy: {e}"),
            Ok(Err(e)) => return Err(e),
            Err(e) => println!("worker panicked: {e}"),
        }
    }

    println!("{:?}", pool.stats());
    pool.shutdown_async().await;

    let mut retired = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PoolEvent::CleanedUp { .. }) {
            retired += 1;
        }
    }
    println!("retired {retired} states");
    Ok(())
}
