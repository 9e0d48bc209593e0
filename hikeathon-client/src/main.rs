use std::{
    io::{self, Write},
    path::PathBuf,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use clap::{Parser, Subcommand};
use hikeathon_client::{
    ApiClient, Backend, ChannelManager, ClientConfig, ConfigArgs, FileStore, StoreError,
    WebToolError,
    config::default_data_dir,
    logging::init_logging,
    resolve_config,
    stores::{
        AuthStore, BroadcastFeed, ChatHistoryStore, ChatStore, ImageStore, SettingsStore,
        TodoService, WebTools,
        web_tools::{
            DEFAULT_RESULT_COUNT, MAX_URLS, RELEVANT_CHARS, extract_relevant_content,
            extract_urls, format_search_results,
        },
    },
};
use hikeathon_core::{
    CsrfGuard, KeyValueStore, MemoryStore, SessionVault, TokenSecurity,
    records::{TodoFilters, TodoStatus},
};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "hikeathon", version, about = "HIKEathon team client")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a team code and store the encrypted session.
    Login(CodeArg),
    /// Forget the stored session.
    Logout,
    /// Ask the AI assistant and stream the answer.
    Chat {
        #[command(flatten)]
        code: CodeArg,
        /// Chat model id; defaults to the saved choice.
        #[arg(long)]
        model: Option<String>,
        /// GPT preset whose system prompt to use.
        #[arg(long)]
        preset: Option<String>,
        /// Saved conversation to continue, or `new` to start one.
        #[arg(long)]
        session: Option<String>,
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    /// Search the web, optionally reading the top hits.
    Search {
        #[command(flatten)]
        code: CodeArg,
        /// Number of hits to fetch and condense.
        #[arg(long, default_value_t = 0)]
        read: usize,
        #[arg(required = true)]
        query: Vec<String>,
    },
    /// Fetch the links found in the given text.
    Fetch {
        #[command(flatten)]
        code: CodeArg,
        #[arg(required = true)]
        text: Vec<String>,
    },
    /// Manage saved chat conversations.
    History {
        #[command(subcommand)]
        action: Option<HistoryAction>,
    },
    /// Generate an image and download it.
    Image {
        #[command(flatten)]
        code: CodeArg,
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        size: Option<String>,
        /// Directory to save the image in.
        #[arg(long, default_value = ".")]
        out: PathBuf,
        #[arg(required = true)]
        prompt: Vec<String>,
    },
    /// Print realtime broadcasts until interrupted.
    Broadcasts {
        #[command(flatten)]
        code: CodeArg,
    },
    /// List todos.
    Todos {
        /// Only todos in this status (open, in_progress, completed, blocked).
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        category: Option<String>,
        /// Only overdue todos.
        #[arg(long, default_value_t = false)]
        overdue: bool,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryAction {
    /// List conversations, newest first.
    List,
    /// Print a conversation.
    Show { id: String },
    Rename {
        id: String,
        #[arg(required = true)]
        name: Vec<String>,
    },
    Delete { id: String },
    /// Delete every conversation.
    Clear,
}

#[derive(clap::Args, Debug)]
struct CodeArg {
    /// 8-character team code.
    #[arg(long, env = "HIKEATHON_TEAM_CODE", hide_env_values = true)]
    code: String,
}

/// Everything a command needs, wired once.
struct App {
    config: ClientConfig,
    api: ApiClient,
    durable: Arc<dyn KeyValueStore>,
    auth: Arc<AuthStore>,
}

impl App {
    fn open(config: ClientConfig) -> Result<Self, String> {
        let durable: Arc<dyn KeyValueStore> = Arc::new(
            FileStore::open(config.durable_dir())
                .map_err(|err| format!("failed to open {}: {err}", config.durable_dir().display()))?,
        );
        let ephemeral: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let csrf = CsrfGuard::new(Arc::clone(&ephemeral));
        let api = ApiClient::with_csrf(config.base_url(), &config.anon_key, csrf)
            .map_err(|err| err.to_string())?;
        let vault = SessionVault::new(ephemeral, Arc::clone(&durable));
        let auth = AuthStore::new(api.clone(), vault, TokenSecurity::new());
        Ok(Self {
            config,
            api,
            durable,
            auth,
        })
    }

    /// Reopens the stored session with `code`, logging in afresh when there
    /// is none.
    async fn sign_in(&self, code: &str) -> Result<(), StoreError> {
        if self.auth.restore_session(code).await? {
            return Ok(());
        }
        self.auth.login(code).await
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let data_dir = cli.config.data_dir.clone().unwrap_or_else(default_data_dir);
    init_logging(&data_dir);

    let config = match resolve_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };
    let app = match App::open(config) {
        Ok(app) => app,
        Err(err) => {
            error!("startup failed: {err}");
            eprintln!("{err}");
            return ExitCode::FAILURE;
        }
    };

    match run(&app, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("command failed: {err}");
            eprintln!("error: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(app: &App, command: Command) -> Result<(), StoreError> {
    match command {
        Command::Login(CodeArg { code }) => {
            app.auth.login(&code).await?;
            let state = app.auth.state();
            if let Some(team) = state.team {
                let hours = app.auth.time_until_expiry().as_secs() / 3600;
                println!("Logged in as {} (session valid for {hours} h)", team.name);
                if state.is_admin {
                    println!("This team has admin rights.");
                }
            }
            Ok(())
        }
        Command::Logout => {
            app.auth.logout();
            println!("Logged out.");
            Ok(())
        }
        Command::Chat {
            code,
            model,
            preset,
            session,
            prompt,
        } => chat(app, &code.code, model, preset, session, &prompt.join(" ")).await,
        Command::Search { code, read, query } => {
            search(app, &code.code, read, &query.join(" ")).await
        }
        Command::Fetch { code, text } => fetch(app, &code.code, &text.join(" ")).await,
        Command::History { action } => history(app, action.unwrap_or(HistoryAction::List)),
        Command::Image {
            code,
            model,
            size,
            out,
            prompt,
        } => image(app, &code.code, model, size, &out, &prompt.join(" ")).await,
        Command::Broadcasts { code } => listen(app, &code.code).await,
        Command::Todos {
            status,
            category,
            overdue,
        } => todos(app, status, category, overdue).await,
    }
}

async fn chat(
    app: &App,
    code: &str,
    model: Option<String>,
    preset: Option<String>,
    session: Option<String>,
    prompt: &str,
) -> Result<(), StoreError> {
    app.sign_in(code).await?;
    let settings = SettingsStore::new(Arc::clone(&app.durable));
    let chat = ChatStore::with_storage(app.api.clone(), Arc::clone(&app.durable));
    let history = ChatHistoryStore::open(Arc::clone(&app.durable));
    match session.as_deref() {
        None => {}
        Some("new") => {
            chat.clear_messages();
            history.create_session(Some(prompt), None, &chat.state());
        }
        Some(id) => {
            let saved = history
                .session(id)
                .ok_or_else(|| StoreError::NotFound(format!("chat session {id}")))?;
            history.switch_session(id);
            chat.open_session(&saved);
        }
    }
    if let Some(model) = model
        && !chat.set_model(&model)
    {
        return Err(StoreError::NotFound(format!("chat model {model}")));
    }
    let system_prompt = match preset {
        Some(key) => settings
            .select_preset(&key)
            .ok_or_else(|| StoreError::NotFound(format!("preset {key}")))?,
        None => settings.get().current_system_prompt().to_owned(),
    };
    chat.set_system_prompt(&system_prompt);

    let printed = Arc::new(AtomicUsize::new(0));
    let mut updates = chat.subscribe();
    let printer = {
        let printed = Arc::clone(&printed);
        tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                let state = updates.borrow_and_update().clone();
                let Some(id) = state.streaming_id else {
                    continue;
                };
                if let Some(message) = state.messages.iter().find(|m| m.id == id) {
                    print_tail(&message.content, &printed);
                }
            }
        })
    };

    let result = chat.send_message(prompt).await;
    printer.abort();
    let _ = printer.await;
    let session_id = history.save_chat(&chat.state());
    info!(session = %session_id, "conversation saved");
    let Some(reply_id) = result? else {
        return Ok(());
    };
    let state = chat.state();
    if let Some(message) = state.messages.into_iter().find(|m| m.id == reply_id) {
        match &message.error {
            Some(_) => println!("\n{}", message.content),
            None => {
                print_tail(&message.content, &printed);
                println!();
            }
        }
        info!(tokens = message.tokens.unwrap_or_default(), "chat reply complete");
    }
    Ok(())
}

/// Prints whatever part of a growing reply has not been printed yet.
fn print_tail(content: &str, printed: &AtomicUsize) {
    let done = printed.load(Ordering::Relaxed);
    if let Some(tail) = content.get(done..)
        && !tail.is_empty()
    {
        print!("{tail}");
        let _ = io::stdout().flush();
        printed.store(content.len(), Ordering::Relaxed);
    }
}

async fn image(
    app: &App,
    code: &str,
    model: Option<String>,
    size: Option<String>,
    out: &std::path::Path,
    prompt: &str,
) -> Result<(), StoreError> {
    app.sign_in(code).await?;
    let images = ImageStore::new(app.api.clone(), Arc::clone(&app.durable));
    if let Some(model) = model
        && !images.set_model(&model)
    {
        return Err(StoreError::NotFound(format!("image model {model}")));
    }
    if let Some(size) = size
        && !images.set_size(&size)
    {
        return Err(StoreError::NotFound(format!("size {size} for this model")));
    }

    let Some(generated) = images.generate_image(prompt).await? else {
        println!("Nothing to generate.");
        return Ok(());
    };
    if let Some(revised) = &generated.revised_prompt {
        println!("Revised prompt: {revised}");
    }
    let path = images.download(&generated, out).await?;
    println!("Saved {}", path.display());
    Ok(())
}

async fn listen(app: &App, code: &str) -> Result<(), StoreError> {
    app.sign_in(code).await?;
    let url = app
        .config
        .realtime_url()
        .map_err(|err| StoreError::Storage(format!("realtime url: {err}")))?;
    let realtime = ChannelManager::connect(url, app.auth.realtime_identity());
    realtime.start();

    let feed = BroadcastFeed::new();
    let mut snapshots = realtime.subscribe();
    println!("Listening for broadcasts, press Ctrl-C to stop.");
    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let broadcasts = snapshots.borrow_and_update().broadcasts.clone();
                for message in broadcasts.into_iter().rev() {
                    let line = format!(
                        "[{}] {}{}",
                        message.kind.as_str(),
                        message.title.as_deref().map(|t| format!("{t}: ")).unwrap_or_default(),
                        message.message
                    );
                    if feed.add(message) {
                        println!("{line}");
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    realtime.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    Ok(())
}

async fn todos(
    app: &App,
    status: Option<String>,
    category: Option<String>,
    overdue: bool,
) -> Result<(), StoreError> {
    let status = match status.as_deref() {
        None => None,
        Some("open") => Some(TodoStatus::Open),
        Some("in_progress") => Some(TodoStatus::InProgress),
        Some("completed") => Some(TodoStatus::Completed),
        Some("blocked") => Some(TodoStatus::Blocked),
        Some(other) => return Err(StoreError::NotFound(format!("status {other}"))),
    };
    let filters = TodoFilters {
        status,
        category,
        overdue: overdue.then_some(true),
        ..TodoFilters::default()
    };
    let service = TodoService::new(Backend::new(app.api.clone()));
    let todos = service.list(&filters).await?;
    if todos.is_empty() {
        println!("No todos.");
    }
    for todo in todos {
        println!(
            "{:>2}  {:<12} {:<10} {}",
            todo.priority,
            todo.status.as_str(),
            todo.category,
            todo.title
        );
    }
    Ok(())
}

async fn search(app: &App, code: &str, read: usize, query: &str) -> Result<(), StoreError> {
    app.sign_in(code).await?;
    let tools = WebTools::new(app.api.clone());
    if read == 0 {
        let response = tools.search_web(query, DEFAULT_RESULT_COUNT).await?;
        println!("{}", format_search_results(&response));
        return Ok(());
    }

    let (response, pages) = tools.search_and_fetch(query, read.min(MAX_URLS)).await?;
    println!("{}", format_search_results(&response));
    let condensed = extract_relevant_content(&pages, query, RELEVANT_CHARS);
    for (page, relevant) in pages.iter().zip(condensed) {
        let body = if relevant.is_empty() {
            page.summary()
        } else {
            relevant
        };
        println!("\n## {}\n{body}", page.url);
    }
    Ok(())
}

async fn fetch(app: &App, code: &str, text: &str) -> Result<(), StoreError> {
    let urls = extract_urls(text);
    if urls.is_empty() {
        return Err(WebToolError::InvalidUrl(text.to_owned()).into());
    }
    app.sign_in(code).await?;
    let tools = WebTools::new(app.api.clone());
    for (url, outcome) in tools.fetch_urls(&urls).await {
        match outcome {
            Ok(page) => println!("{url} ({})\n{}\n", page.content_type, page.summary()),
            Err(err) => println!("{url}: {err}\n"),
        }
    }
    Ok(())
}

fn history(app: &App, action: HistoryAction) -> Result<(), StoreError> {
    let history = ChatHistoryStore::open(Arc::clone(&app.durable));
    match action {
        HistoryAction::List => {
            let state = history.state();
            if state.sessions.is_empty() {
                println!("No saved conversations.");
            }
            for session in &state.sessions {
                let marker = if state.current_session_id.as_deref() == Some(session.id.as_str()) {
                    '*'
                } else {
                    ' '
                };
                println!(
                    "{marker} {}  {:<40}  {:>3} messages  {}",
                    session.id,
                    session.name,
                    session.messages.len(),
                    session.updated_at.format("%Y-%m-%d %H:%M")
                );
            }
        }
        HistoryAction::Show { id } => {
            let session = history
                .session(&id)
                .ok_or_else(|| StoreError::NotFound(format!("chat session {id}")))?;
            println!("# {} ({})", session.name, session.model);
            for message in session.conversation() {
                println!("\n[{:?}]\n{}", message.role, message.content);
            }
        }
        HistoryAction::Rename { id, name } => {
            if !history.rename_session(&id, &name.join(" ")) {
                return Err(StoreError::NotFound(format!("chat session {id}")));
            }
        }
        HistoryAction::Delete { id } => {
            if !history.delete_session(&id) {
                return Err(StoreError::NotFound(format!("chat session {id}")));
            }
        }
        HistoryAction::Clear => {
            history.delete_all_sessions();
            println!("Chat history cleared.");
        }
    }
    Ok(())
}
