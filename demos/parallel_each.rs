//! Forks one worker per file and prints the file sizes in fork order once
//! every worker has joined.

use serde_json::json;
use std::process;
use weir::prelude::*;

#[tokio::main]
async fn main() {
    let sizes = parallel_each(
        |ctx: Context, _args: Vec<TaskValue>| {
            ctx.fork(vec![json!("README.md"), json!("Cargo.toml")]);
        },
        |fork: ForkContext, item: TaskValue| {
            let path = item.as_str().unwrap_or_default().to_string();
            tokio::spawn(async move {
                match tokio::fs::read(&path).await {
                    Ok(bytes) => fork.join(json!(bytes.len())),
                    Err(e) => fork.end(e.into()),
                }
            });
        },
        |ctx: Context, error: Option<TaskError>, results: Vec<TaskValue>| {
            if let Some(err) = error {
                eprintln!("{err}");
                process::exit(1);
            }
            println!("{results:?}");
            ctx.next(Vec::new());
        },
    );

    sizes.call(Vec::new()).await.expect("flow completed");
}
