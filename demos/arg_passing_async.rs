//! Reads two files concurrently from one step and receives their contents
//! in declaration order in the next, regardless of which read finishes
//! first.

use serde_json::json;
use std::process;
use weir::prelude::*;

/// Starts one file read; the operation reports (path, contents) and the
/// selector keeps only the contents.
fn read_file(ctx: &Context, path: &str) {
    let cb = ctx.async_as(nth(1));
    let path = path.to_string();
    tokio::spawn(async move {
        match tokio::fs::read_to_string(&path).await {
            Ok(text) => cb.ok(vec![json!(path), json!(text)]),
            Err(e) => cb.fail(e.into()),
        }
    });
}

#[tokio::main]
async fn main() {
    let my_flow = Flow::builder()
        .named("myFlow")
        .task(|ctx: Context, args: Vec<TaskValue>| {
            for file in &args {
                read_file(&ctx, file.as_str().unwrap_or_default());
            }
        })
        .task(|ctx: Context, args: Vec<TaskValue>| {
            if let Some(err) = ctx.err() {
                eprintln!("{err}");
                process::exit(1);
            }
            for contents in &args {
                print!("{}", contents.as_str().unwrap_or_default());
            }
            println!("done");
            ctx.next(Vec::new());
        })
        .build();

    my_flow
        .call(vec![json!("README.md"), json!("Cargo.toml")])
        .await
        .expect("flow completed");
}
