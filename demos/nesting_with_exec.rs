//! Embeds one compiled flow inside another with `exec`: the sub-flow runs
//! its full lifecycle and reports back through an ordinary completion
//! callback.

use serde_json::json;
use std::process;
use weir::prelude::*;

#[tokio::main]
async fn main() {
    let sub_flow = Flow::builder()
        .named("subFlow")
        .task(|ctx: Context, args: Vec<TaskValue>| {
            let cb = ctx.async_cb();
            let path = args[0].as_str().unwrap_or_default().to_string();
            tokio::spawn(async move {
                match tokio::fs::read_to_string(&path).await {
                    Ok(text) => cb.ok(vec![json!(text)]),
                    Err(e) => cb.fail(e.into()),
                }
            });
        })
        .build();

    let main_flow = Flow::builder()
        .named("mainFlow")
        .task(move |ctx: Context, _args: Vec<TaskValue>| {
            let cb = ctx.async_cb();
            ctx.exec(&sub_flow, vec![json!("README.md")], cb);
        })
        .task(|ctx: Context, args: Vec<TaskValue>| {
            if let Some(err) = ctx.err() {
                eprintln!("{err}");
                process::exit(1);
            }
            println!("{}", args[0].as_str().unwrap_or_default());
            println!("done");
            ctx.next(Vec::new());
        })
        .build();

    main_flow.call(Vec::new()).await.expect("flow completed");
}
