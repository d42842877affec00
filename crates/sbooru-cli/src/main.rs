use std::fs;
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use sbooru_contracts::chat::{parse_intent, CHAT_HELP_COMMANDS};
use sbooru_contracts::config::PluginConfig;
use sbooru_contracts::dialogue::{DialogueStore, FileDialogueStore, MemoryDialogueStore};
use sbooru_contracts::outcomes::{ActionRecord, OutcomeLog};
use sbooru_contracts::records::Rating;
use sbooru_contracts::tags::extract_tags;
use sbooru_engine::{
    validate_tags, EncodedImage, HandlerOutcome, Host, ImageBoard, InboundMessage,
    SafebooruClient, SafebooruPlugin, SafebooruTagIndex, SearchRequest, TOOL_NAME,
};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "sbooru-rs", version, about = "Safebooru image search from the terminal")]
struct Cli {
    /// JSON config file; SAFEBOORU_* environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Interactive chat standing in for the host runtime.
    Chat(ChatArgs),
    /// Print the tags extracted from free text.
    Tags(TextArgs),
    /// Validate a tag string against the tag index and print the result.
    Validate(TextArgs),
    /// Run one search and print the matching posts.
    Search(SearchArgs),
    /// Call the safebooru_search tool with a JSON argument object.
    Tool(ToolArgs),
}

#[derive(Debug, Parser)]
struct ChatArgs {
    /// Where received images are written.
    #[arg(long, default_value = "sbooru-out")]
    out: PathBuf,
    /// Outcome log; defaults to <out>/outcomes.jsonl.
    #[arg(long)]
    events: Option<PathBuf>,
    /// Keep clarification state in this JSON file across runs.
    #[arg(long)]
    state: Option<PathBuf>,
    #[arg(long)]
    conversation: Option<String>,
    /// Route plain text through the natural-language action.
    #[arg(long)]
    natural: bool,
    /// Behave like a group chat: only lines starting with '@' mention the bot.
    #[arg(long)]
    group: bool,
    #[arg(long)]
    nickname: Option<String>,
    #[arg(long)]
    show_tags: bool,
}

#[derive(Debug, Parser)]
struct TextArgs {
    #[arg(required = true)]
    text: Vec<String>,
}

#[derive(Debug, Parser)]
struct SearchArgs {
    #[arg(required = true)]
    tags: Vec<String>,
    #[arg(long)]
    limit: Option<u32>,
    #[arg(long)]
    rating: Option<Rating>,
}

#[derive(Debug, Parser)]
struct ToolArgs {
    /// e.g. '{"tags": "hatsune_miku", "limit": 3}'
    args: String,
}

fn main() {
    init_tracing();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("sbooru-rs error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .compact()
        .init();
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let config = PluginConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Chat(args) => {
            run_chat(config, args)?;
            Ok(0)
        }
        Command::Tags(args) => {
            println!("{}", extract_tags(&args.text.join(" ")).join());
            Ok(0)
        }
        Command::Validate(args) => run_validate(&config, &args.text.join(" ")),
        Command::Search(args) => run_search(&config, args),
        Command::Tool(args) => run_tool(config, &args.args),
    }
}

fn run_validate(config: &PluginConfig, tags: &str) -> Result<i32> {
    let index = SafebooruTagIndex::new(
        &config.safebooru.api_base,
        Duration::from_secs(config.safebooru.timeout_secs.max(1)),
    )?;
    let result = validate_tags(&index, tags);
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(0)
}

fn run_search(config: &PluginConfig, args: SearchArgs) -> Result<i32> {
    let client = SafebooruClient::new(
        &config.safebooru.api_base,
        Duration::from_secs(config.safebooru.download_timeout_secs.max(1)),
    )?;
    let request = SearchRequest {
        tags: args.tags.join(" "),
        limit: args.limit.unwrap_or_else(|| config.safebooru.search_limit()),
        rating: args.rating.unwrap_or(config.safebooru.rating),
        timeout: Duration::from_secs(config.safebooru.timeout_secs.max(1)),
    };
    let records = client.search(&request);
    println!("{}", serde_json::to_string_pretty(&records)?);
    Ok(if records.is_empty() { 2 } else { 0 })
}

fn run_tool(config: PluginConfig, raw_args: &str) -> Result<i32> {
    let args: Value = serde_json::from_str(raw_args)
        .with_context(|| format!("{TOOL_NAME} arguments must be a JSON object"))?;
    if !args.is_object() {
        bail!("{TOOL_NAME} arguments must be a JSON object");
    }
    let plugin = SafebooruPlugin::from_config(config, Arc::new(MemoryDialogueStore::new()))?;
    let response = plugin.call_tool(&args);
    println!("{}", serde_json::to_string_pretty(&response)?);
    let success = response
        .get("success")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(if success { 0 } else { 2 })
}

fn run_chat(mut config: PluginConfig, args: ChatArgs) -> Result<()> {
    if let Some(nickname) = args.nickname.clone() {
        config.bot.nickname = Some(nickname);
    }
    if args.show_tags {
        config.response.show_tags = true;
    }
    let dialogue: Arc<dyn DialogueStore> = match args.state.clone() {
        Some(path) => Arc::new(FileDialogueStore::new(path)),
        None => Arc::new(MemoryDialogueStore::new()),
    };
    let plugin = SafebooruPlugin::from_config(config, dialogue)?;

    fs::create_dir_all(&args.out)
        .with_context(|| format!("failed creating {}", args.out.display()))?;
    let events_path = args
        .events
        .clone()
        .unwrap_or_else(|| args.out.join("outcomes.jsonl"));
    let mut host = TerminalHost::new(&args.out, OutcomeLog::new(events_path));
    let conversation_id = args
        .conversation
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    info!("conversation {conversation_id}");

    let stdin = io::stdin();
    let mut line = String::new();
    let mut last_active: Option<SystemTime> = None;

    println!("Safebooru chat started. Type /help for commands.");
    if args.group {
        println!("Group mode: start a line with '@' to address the bot.");
    }

    loop {
        print!("> ");
        io::stdout().flush()?;

        line.clear();
        let read = match stdin.read_line(&mut line) {
            Ok(read) => read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err.into()),
        };
        if read == 0 {
            break;
        }

        let (is_mentioned, text) = split_mention(line.trim_end_matches(['\n', '\r']), args.group);
        let intent = parse_intent(text);
        let message = InboundMessage {
            conversation_id: conversation_id.clone(),
            text: text.to_string(),
            is_mentioned,
            last_active,
        };

        let outcome = match intent.action.as_str() {
            "noop" => continue,
            "help" => {
                println!("Commands: {}", CHAT_HELP_COMMANDS.join(" "));
                continue;
            }
            "natural" if !args.natural => {
                println!("(plain text is ignored; restart with --natural to search with it)");
                continue;
            }
            "natural" => plugin.handle_action(&message, None, &mut host),
            _ => plugin.handle_command(&message, &mut host),
        };

        debug!("handler outcome: {outcome:?}");
        host.record_outcome(&conversation_id, text, &outcome)?;
        if outcome.handled {
            last_active = Some(SystemTime::now());
        }
    }

    Ok(())
}

/// Strips a leading `@` and reports whether the line addressed the bot.
/// Outside group mode every line does.
fn split_mention(input: &str, group: bool) -> (bool, &str) {
    let trimmed = input.trim();
    match trimmed.strip_prefix('@') {
        Some(rest) => (true, rest.trim_start()),
        None => (!group, trimmed),
    }
}

/// Prints replies, writes images to disk and appends outcomes to a JSONL log.
struct TerminalHost {
    out_dir: PathBuf,
    outcomes: OutcomeLog,
}

impl TerminalHost {
    fn new(out_dir: &Path, outcomes: OutcomeLog) -> Self {
        Self {
            out_dir: out_dir.to_path_buf(),
            outcomes,
        }
    }

    fn record_outcome(
        &self,
        conversation_id: &str,
        input: &str,
        outcome: &HandlerOutcome,
    ) -> Result<()> {
        let mut payload = Map::new();
        payload.insert("input".to_string(), Value::String(input.to_string()));
        payload.insert("handled".to_string(), Value::Bool(outcome.handled));
        payload.insert(
            "message".to_string(),
            Value::String(outcome.message.clone()),
        );
        self.outcomes
            .record("handler_outcome", conversation_id, payload)?;
        Ok(())
    }
}

impl Host for TerminalHost {
    fn send_text(&mut self, _conversation_id: &str, text: &str) -> Result<()> {
        println!("bot> {text}");
        Ok(())
    }

    fn send_image(&mut self, conversation_id: &str, image: &EncodedImage) -> Result<bool> {
        let bytes = BASE64
            .decode(image.base64.as_bytes())
            .context("image payload is not valid base64")?;
        if bytes.is_empty() {
            return Ok(false);
        }
        let path = self.out_dir.join(format!("sb-{}.jpg", short_hash(&bytes)));
        fs::write(&path, &bytes).with_context(|| format!("failed writing {}", path.display()))?;
        println!("bot> [image: {}]", path.display());

        let mut payload = Map::new();
        payload.insert(
            "path".to_string(),
            Value::String(path.to_string_lossy().to_string()),
        );
        payload.insert("bytes".to_string(), json!(bytes.len()));
        payload.insert(
            "mime_type".to_string(),
            Value::String(image.mime_type().to_string()),
        );
        self.outcomes.record("image_sent", conversation_id, payload)?;
        Ok(true)
    }

    fn store_action_info(&mut self, conversation_id: &str, record: &ActionRecord) -> Result<()> {
        debug!("action info: {}", record.prompt_display);
        self.outcomes.record_action(conversation_id, record)?;
        Ok(())
    }
}

fn short_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    hex::encode(&digest[..6])
}
