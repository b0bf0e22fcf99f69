//! Teambook CLI.
//!
//! Commands map one-to-one onto kernel verbs. Output is pipe-delimited by
//! default or JSON with `TEAMBOOK_FORMAT=json`; errors print `!code|detail`
//! and exit nonzero.

mod mcp;
mod render;

use clap::{Parser, Subcommand};
use serde_json::{json, Value as JsonValue};
use teambook_core::{OutputFormat, TeambookConfig};
use teambook_kernel::Kernel;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "teambook", version, about = "Multi-agent collaboration substrate")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a note
    Write {
        content: String,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        pinned: bool,
        #[arg(long = "type")]
        note_type: Option<String>,
        #[arg(long)]
        verbatim: bool,
    },
    /// Read notes
    Read {
        #[arg(long)]
        tag: Option<String>,
        #[arg(long = "type")]
        note_type: Option<String>,
        #[arg(long)]
        query: Option<String>,
        #[arg(long, default_value = "recent")]
        mode: String,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        pinned_only: bool,
    },
    /// Fetch one note ("last", "note:N", or N)
    Get { id: String },
    /// Semantic/text recall
    Recall {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Pin a note
    Pin { id: String },
    /// Unpin a note
    Unpin { id: String },
    /// Delete a note
    Delete { id: String },
    /// Send a broadcast or DM
    Send {
        content: String,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        channel: Option<String>,
        #[arg(long)]
        reply_to: Option<i64>,
        #[arg(long)]
        summary: Option<String>,
        #[arg(long)]
        ttl_hours: Option<i64>,
    },
    /// Read channel messages
    Messages {
        #[arg(long, default_value = "general")]
        channel: String,
        #[arg(long)]
        since: Option<String>,
        #[arg(long)]
        unread_only: bool,
        #[arg(long)]
        full: bool,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Read direct messages addressed to this AI
    Dms {
        #[arg(long)]
        unread_only: bool,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Acquire a distributed lock
    Lock {
        resource_id: String,
        #[arg(long, default_value_t = 60)]
        timeout: i64,
    },
    /// Release a lock
    Unlock { resource_id: String },
    /// Extend a held lock
    Extend {
        resource_id: String,
        #[arg(long, default_value_t = 60)]
        seconds: i64,
    },
    /// Queue a task
    Queue {
        task: String,
        #[arg(long, default_value_t = 5)]
        priority: i64,
    },
    /// Claim the best pending task
    Claim {
        #[arg(long)]
        fifo: bool,
    },
    /// Complete a claimed task
    Complete {
        id: String,
        #[arg(long)]
        result: Option<String>,
    },
    /// Watch an item for events
    Watch {
        item_type: String,
        item_id: String,
        #[arg(long, value_delimiter = ',')]
        event_types: Vec<String>,
    },
    /// Stop watching an item
    Unwatch { item_type: String, item_id: String },
    /// Pull delivered events
    Events {
        #[arg(long)]
        since: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long)]
        peek: bool,
    },
    /// Who is active in this teambook
    Whois {
        #[arg(long, default_value_t = 15)]
        minutes: i64,
    },
    /// Set a status message
    Status {
        #[arg(long)]
        message: Option<String>,
    },
    /// Start an evolution
    Evolve {
        goal: String,
        #[arg(long)]
        output: Option<String>,
    },
    /// Contribute an idea to an evolution
    Contribute {
        evo_id: String,
        content: String,
        #[arg(long)]
        approach: Option<String>,
    },
    /// List contributions (ranked)
    Contributions { evo_id: String },
    /// Rank a contribution 0-10
    Rank {
        contrib_id: i64,
        score: f64,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Record a ranked-preference vote
    Vote {
        evo_id: String,
        #[arg(value_delimiter = ',')]
        preferred: Vec<i64>,
    },
    /// Synthesize contributions into the output artifact
    Synthesize {
        evo_id: String,
        #[arg(long, default_value = "top")]
        strategy: String,
        #[arg(long, default_value_t = 7.0)]
        min_score: f64,
    },
    /// Detect contribution conflicts
    Conflicts { evo_id: String },
    /// Vault operations
    #[command(subcommand)]
    Vault(VaultCommand),
    /// Switch the active teambook
    Use { name: String },
    /// List known teambooks
    Teambooks,
    /// Open a detangle conversation
    Detangle {
        with: String,
        description: String,
    },
    /// Resolve a detangle conversation
    Resolve {
        room_id: i64,
        summary: String,
    },
    /// Kernel status and stats
    Info,
    /// Housekeeping: purge expired records
    Maintenance,
    /// Run the MCP stdio host (JSON-RPC 2.0)
    Mcp,
}

#[derive(Subcommand)]
enum VaultCommand {
    Set { key: String, value: String },
    Get { key: String },
    Delete { key: String },
    List,
}

fn verb_and_args(command: &Command) -> (&'static str, JsonValue) {
    match command {
        Command::Write {
            content,
            summary,
            tags,
            pinned,
            note_type,
            verbatim,
        } => (
            "write_note",
            json!({
                "content": content,
                "summary": summary,
                "tags": tags,
                "pinned": pinned,
                "type": note_type,
                "representation_policy": if *verbatim { "verbatim" } else { "default" },
            }),
        ),
        Command::Read {
            tag,
            note_type,
            query,
            mode,
            limit,
            pinned_only,
        } => (
            "read_notes",
            json!({
                "tag": tag,
                "type": note_type,
                "query": query,
                "mode": mode,
                "limit": limit,
                "pinned_only": pinned_only,
            }),
        ),
        Command::Get { id } => ("get_note", json!({"id": id})),
        Command::Recall { query, limit } => ("recall", json!({"query": query, "limit": limit})),
        Command::Pin { id } => ("pin", json!({"id": id})),
        Command::Unpin { id } => ("unpin", json!({"id": id})),
        Command::Delete { id } => ("delete_note", json!({"id": id})),
        Command::Send {
            content,
            to,
            channel,
            reply_to,
            summary,
            ttl_hours,
        } => (
            "send_message",
            json!({
                "content": content,
                "to": to,
                "channel": channel,
                "reply_to": reply_to,
                "summary": summary,
                "ttl_hours": ttl_hours,
            }),
        ),
        Command::Messages {
            channel,
            since,
            unread_only,
            full,
            limit,
        } => (
            "get_messages",
            json!({
                "channel": channel,
                "since": since,
                "unread_only": unread_only,
                "compact": !full,
                "limit": limit,
            }),
        ),
        Command::Dms { unread_only, limit } => (
            "read_dms",
            json!({"unread_only": unread_only, "limit": limit}),
        ),
        Command::Lock {
            resource_id,
            timeout,
        } => (
            "acquire_lock",
            json!({"resource_id": resource_id, "timeout": timeout}),
        ),
        Command::Unlock { resource_id } => ("release_lock", json!({"resource_id": resource_id})),
        Command::Extend {
            resource_id,
            seconds,
        } => (
            "extend_lock",
            json!({"resource_id": resource_id, "seconds": seconds}),
        ),
        Command::Queue { task, priority } => {
            ("queue_task", json!({"task": task, "priority": priority}))
        }
        Command::Claim { fifo } => ("claim_task", json!({"prefer_priority": !fifo})),
        Command::Complete { id, result } => {
            ("complete_task", json!({"id": id, "result": result}))
        }
        Command::Watch {
            item_type,
            item_id,
            event_types,
        } => (
            "watch",
            json!({
                "item_type": item_type,
                "item_id": item_id,
                "event_types": event_types,
            }),
        ),
        Command::Unwatch { item_type, item_id } => (
            "unwatch",
            json!({"item_type": item_type, "item_id": item_id}),
        ),
        Command::Events { since, limit, peek } => (
            "get_events",
            json!({"since": since, "limit": limit, "mark_seen": !peek}),
        ),
        Command::Whois { minutes } => ("who_is_here", json!({"minutes": minutes})),
        Command::Status { message } => ("set_status", json!({"message": message})),
        Command::Evolve { goal, output } => ("evolve", json!({"goal": goal, "output": output})),
        Command::Contribute {
            evo_id,
            content,
            approach,
        } => (
            "contribute",
            json!({"evo_id": evo_id, "content": content, "approach": approach}),
        ),
        Command::Contributions { evo_id } => ("contributions", json!({"evo_id": evo_id})),
        Command::Rank {
            contrib_id,
            score,
            reason,
        } => (
            "rank",
            json!({"contrib_id": contrib_id, "score": score, "reason": reason}),
        ),
        Command::Vote { evo_id, preferred } => {
            ("vote", json!({"evo_id": evo_id, "preferred": preferred}))
        }
        Command::Synthesize {
            evo_id,
            strategy,
            min_score,
        } => (
            "synthesize",
            json!({"evo_id": evo_id, "strategy": strategy, "min_score": min_score}),
        ),
        Command::Conflicts { evo_id } => ("conflicts", json!({"evo_id": evo_id})),
        Command::Vault(vault) => match vault {
            VaultCommand::Set { key, value } => ("vault_set", json!({"key": key, "value": value})),
            VaultCommand::Get { key } => ("vault_get", json!({"key": key})),
            VaultCommand::Delete { key } => ("vault_delete", json!({"key": key})),
            VaultCommand::List => ("vault_list", json!({})),
        },
        Command::Use { name } => ("use_teambook", json!({"name": name})),
        Command::Teambooks => ("list_teambooks", json!({})),
        Command::Detangle { with, description } => (
            "detangle_open",
            json!({"with": with, "description": description}),
        ),
        Command::Resolve { room_id, summary } => (
            "detangle_resolve",
            json!({"room_id": room_id, "summary": summary}),
        ),
        Command::Info => ("get_status", json!({})),
        Command::Maintenance => ("maintenance", json!({})),
        Command::Mcp => unreachable!("handled before dispatch"),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = TeambookConfig::from_env();
    let format = config.format;
    let force_ascii = config.force_ascii;
    let kernel = Kernel::bootstrap(config).await;

    if matches!(cli.command, Command::Mcp) {
        let code = mcp::serve_stdio(kernel).await;
        std::process::exit(code);
    }

    let (verb, args) = verb_and_args(&cli.command);
    let response = kernel.execute(verb, &args).await;
    let exit = if response.success { 0 } else { 1 };
    let rendered = match format {
        OutputFormat::Json => serde_json::to_string_pretty(&response)
            .unwrap_or_else(|_| "{}".to_string()),
        OutputFormat::Pipe => render::pipe(&response),
    };
    if force_ascii {
        println!("{}", rendered.replace(|c: char| !c.is_ascii(), "?"));
    } else {
        println!("{}", rendered);
    }
    std::process::exit(exit);
}
