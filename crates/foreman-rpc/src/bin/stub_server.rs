//! Minimal line-delimited JSON-RPC tool server used by the transport
//! integration tests.  Not part of the product surface.
//!
//! Tools:
//! - `echo {text}` — returns the text; with `progress: true` it first emits a
//!   `notifications/tool_progress` notification.
//! - `fail {message?}` — returns an `isError` result.
//! - `crash {}` — writes to stderr and exits without responding, simulating a
//!   dying server.

use std::io::{BufRead, Write};

use serde_json::{json, Value};

fn send(msg: &Value) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{msg}");
    let _ = stdout.flush();
}

fn tool_list() -> Value {
    json!({
        "tools": [
            {
                "name": "echo",
                "description": "Echo the given text back",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "text": {"type": "string"},
                        "progress": {"type": "boolean"}
                    },
                    "required": ["text"]
                }
            },
            {
                "name": "fail",
                "description": "Always returns an error result",
                "inputSchema": {"type": "object", "properties": {"message": {"type": "string"}}}
            },
            {
                "name": "crash",
                "description": "Exit without responding",
                "inputSchema": {"type": "object", "properties": {}}
            }
        ]
    })
}

fn call_tool(params: &Value) -> Value {
    let name = params["name"].as_str().unwrap_or("");
    let args = &params["arguments"];
    match name {
        "echo" => {
            let text = args["text"].as_str().unwrap_or("");
            if args["progress"].as_bool().unwrap_or(false) {
                send(&json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/tool_progress",
                    "params": { "output": format!("echoing: {text}") }
                }));
            }
            json!({ "content": [{"type": "text", "text": text}], "isError": false })
        }
        "fail" => {
            let message = args["message"].as_str().unwrap_or("tool failed");
            json!({ "content": [{"type": "text", "text": format!("Error: {message}")}], "isError": true })
        }
        "crash" => {
            eprintln!("stub server: crashing on request");
            std::process::exit(3);
        }
        other => {
            json!({ "content": [{"type": "text", "text": format!("Unknown tool: {other}")}], "isError": true })
        }
    }
}

fn main() {
    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let Ok(msg) = serde_json::from_str::<Value>(&line) else { continue };

        let method = msg["method"].as_str().unwrap_or("");
        let id = msg["id"].clone();

        let result = match method {
            "initialize" => json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {},
                "serverInfo": { "name": "foreman-stub", "version": "1.0" }
            }),
            "tools/list" => tool_list(),
            "tools/call" => call_tool(&msg["params"]),
            // Client notifications carry no id and get no reply.
            _ => continue,
        };

        if !id.is_null() {
            send(&json!({ "jsonrpc": "2.0", "id": id, "result": result }));
        }
    }
}
