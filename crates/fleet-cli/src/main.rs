mod config;
mod http;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use config::FleetConfig;
use fleet_db::pool;
use http::AppState;

#[derive(Parser)]
#[command(name = "fleet", about = "Task routing and dispatch backend")]
struct Cli {
    /// Database URL (overrides DATABASE_URL env var and the config file)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a fleet config file (no database required)
    Init {
        /// Database connection URL
        #[arg(long, default_value = "sqlite://fleet.db")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Create the database (if needed) and apply all migrations
    DbInit,
    /// Run the HTTP API and the dispatch sweeper until interrupted
    Serve {
        /// Address to bind the HTTP listener to
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,
        /// Port to bind the HTTP listener to
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
    /// Run one dispatch sweep and exit, without starting the server
    Sweep,
    /// Project management
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Agent management
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// User and API key management
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Event-to-destination route management
    Route {
        #[command(subcommand)]
        command: RouteCommands,
    },
}

#[derive(Subcommand)]
enum ProjectCommands {
    /// Create a project
    Create {
        name: String,
        #[arg(long)]
        default_agent: Option<Uuid>,
    },
    /// List all projects
    List,
}

#[derive(Subcommand)]
enum AgentCommands {
    /// Register an agent
    Create {
        name: String,
        /// Comma-separated capability tags
        #[arg(long, value_delimiter = ',')]
        capability: Vec<String>,
        /// Maximum concurrent tasks (omit for unlimited)
        #[arg(long)]
        capacity_max: Option<i32>,
    },
    /// List all agents
    List,
    /// Mint a new API key for an agent
    MintKey { agent_id: Uuid },
}

#[derive(Subcommand)]
enum UserCommands {
    /// Create a user
    Create {
        username: String,
        /// One of admin, reviewer, viewer
        #[arg(long, default_value = "viewer")]
        role: String,
    },
    /// Mint a new API key for a user
    MintKey { user_id: Uuid },
}

#[derive(Subcommand)]
enum RouteCommands {
    /// Subscribe a destination to a trigger event
    Create {
        /// Trigger event, e.g. task.completed
        trigger_event: String,
        /// One of webhook, email, storage, chat
        destination_kind: String,
        /// Destination config as a JSON object
        destination_config: String,
        /// Restrict to one project (omit to subscribe globally)
        #[arg(long)]
        project_id: Option<Uuid>,
        #[arg(long, default_value = "route")]
        name: String,
    },
    /// List routes subscribed to an event within a project (or globally)
    List {
        trigger_event: String,
        #[arg(long)]
        project_id: Option<Uuid>,
    },
}

fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        anyhow::bail!("config file already exists at {}\nUse --force to overwrite.", path.display());
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: db_url.to_string() },
        dispatch: config::DispatchSection::default(),
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    Ok(())
}

async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = FleetConfig::resolve(cli_db_url)?;
    println!("Initializing fleet database at {}...", resolved.db_config.database_url);

    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let db = fleet_db::Db::new(db_pool, &resolved.db_config);
    let migrations_dir = pool::default_migrations_path(resolved.db_config.dialect);
    fleet_db::run_migrations(&db, &migrations_dir).await?;

    println!("fleet db-init complete.");
    Ok(())
}

async fn cmd_serve(cli_db_url: Option<&str>, bind: &str, port: u16) -> anyhow::Result<()> {
    let resolved = FleetConfig::resolve(cli_db_url)?;
    let any_pool = pool::create_pool(&resolved.db_config).await?;
    let db = fleet_db::Db::new(any_pool, &resolved.db_config);
    fleet_db::run_migrations(&db, &pool::default_migrations_path(resolved.db_config.dialect)).await?;

    tokio::fs::create_dir_all(&resolved.upload_root)
        .await
        .with_context(|| format!("failed to create upload root {}", resolved.upload_root.display()))?;

    let http_client = reqwest::Client::new();
    let cancel = CancellationToken::new();
    let sweeper_handle = tokio::spawn(fleet_dispatch::run_sweeper(
        db.clone(),
        http_client.clone(),
        resolved.sweeper_config,
        cancel.clone(),
    ));

    let state = AppState {
        db,
        http_client,
        upload_root: Arc::new(resolved.upload_root),
    };
    let result = http::run_serve(state, bind, port).await;

    cancel.cancel();
    let _ = sweeper_handle.await;
    result
}

async fn cmd_sweep(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = FleetConfig::resolve(cli_db_url)?;
    let any_pool = pool::create_pool(&resolved.db_config).await?;
    let db = fleet_db::Db::new(any_pool, &resolved.db_config);
    let client = reqwest::Client::new();
    let count = fleet_dispatch::sweep_once(&db, &client, resolved.sweeper_config.batch_size).await?;
    println!("swept {count} due deliveries");
    db.pool().close().await;
    Ok(())
}

async fn cmd_project(cli_db_url: Option<&str>, command: ProjectCommands) -> anyhow::Result<()> {
    let resolved = FleetConfig::resolve(cli_db_url)?;
    let any_pool = pool::create_pool(&resolved.db_config).await?;
    let db = fleet_db::Db::new(any_pool, &resolved.db_config);

    match command {
        ProjectCommands::Create { name, default_agent } => {
            let project = fleet_db::queries::projects::insert_project(&db, &name, default_agent).await?;
            println!("created project {} ({})", project.name, project.id);
        }
        ProjectCommands::List => {
            for project in fleet_db::queries::projects::list_projects(&db).await? {
                println!("{}  {}", project.id, project.name);
            }
        }
    }
    db.pool().close().await;
    Ok(())
}

async fn cmd_agent(cli_db_url: Option<&str>, command: AgentCommands) -> anyhow::Result<()> {
    let resolved = FleetConfig::resolve(cli_db_url)?;
    let any_pool = pool::create_pool(&resolved.db_config).await?;
    let db = fleet_db::Db::new(any_pool, &resolved.db_config);

    match command {
        AgentCommands::Create {
            name,
            capability,
            capacity_max,
        } => {
            let agent = fleet_db::queries::agents::insert_agent(&db, &name, &capability, capacity_max).await?;
            println!("created agent {} ({})", agent.name, agent.id);
        }
        AgentCommands::List => {
            for agent in fleet_db::queries::agents::list_agents(&db).await? {
                println!("{}  {}  {}/{}", agent.id, agent.name, agent.capacity_in_use, agent.capacity_max.map(|c| c.to_string()).unwrap_or_else(|| "unlimited".to_string()));
            }
        }
        AgentCommands::MintKey { agent_id } => {
            fleet_db::queries::agents::get_agent(&db, agent_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("agent {agent_id} not found"))?;
            let minted = fleet_auth::keys::mint_agent_key();
            fleet_db::queries::auth::insert_agent_key(&db, agent_id, &minted.prefix, &minted.key_hash).await?;
            println!("{}", minted.plaintext);
            println!("(this key is shown once; store it now)");
        }
    }
    db.pool().close().await;
    Ok(())
}

async fn cmd_user(cli_db_url: Option<&str>, command: UserCommands) -> anyhow::Result<()> {
    let resolved = FleetConfig::resolve(cli_db_url)?;
    let any_pool = pool::create_pool(&resolved.db_config).await?;
    let db = fleet_db::Db::new(any_pool, &resolved.db_config);

    match command {
        UserCommands::Create { username, role } => {
            role.parse::<fleet_auth::Role>().map_err(|e| anyhow::anyhow!(e))?;
            let user = fleet_db::queries::auth::insert_user(&db, &username, &role).await?;
            println!("created user {} ({})", user.username, user.id);
        }
        UserCommands::MintKey { user_id } => {
            fleet_db::queries::auth::get_user(&db, user_id)
                .await?
                .ok_or_else(|| anyhow::anyhow!("user {user_id} not found"))?;
            let minted = fleet_auth::keys::mint_user_key();
            fleet_db::queries::auth::insert_user_key(&db, user_id, &minted.prefix, &minted.key_hash).await?;
            println!("{}", minted.plaintext);
            println!("(this key is shown once; store it now)");
        }
    }
    db.pool().close().await;
    Ok(())
}

async fn cmd_route(cli_db_url: Option<&str>, command: RouteCommands) -> anyhow::Result<()> {
    let resolved = FleetConfig::resolve(cli_db_url)?;
    let any_pool = pool::create_pool(&resolved.db_config).await?;
    let db = fleet_db::Db::new(any_pool, &resolved.db_config);

    match command {
        RouteCommands::Create {
            trigger_event,
            destination_kind,
            destination_config,
            project_id,
            name,
        } => {
            trigger_event
                .parse::<fleet_core::TriggerEvent>()
                .map_err(|e| anyhow::anyhow!(e))?;
            destination_kind
                .parse::<fleet_db::models::DestinationKind>()
                .map_err(|e| anyhow::anyhow!(e))?;
            let config: serde_json::Value =
                serde_json::from_str(&destination_config).context("destination_config must be valid JSON")?;
            let route = fleet_db::queries::routes::insert_route(
                &db,
                project_id,
                &name,
                &trigger_event,
                &destination_kind,
                config,
                None,
                None,
                serde_json::json!({}),
            )
            .await?;
            println!("created route {} ({})", route.name, route.id);
        }
        RouteCommands::List { trigger_event, project_id } => {
            let routes =
                fleet_db::queries::routes::list_routes_for_event(&db, project_id.unwrap_or(Uuid::nil()), &trigger_event).await?;
            for route in routes {
                println!("{}  {}  -> {}", route.id, route.name, route.destination_kind);
            }
        }
    }
    db.pool().close().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Init { db_url, force } => cmd_init(&db_url, force),
        Commands::DbInit => cmd_db_init(cli.database_url.as_deref()).await,
        Commands::Serve { bind, port } => cmd_serve(cli.database_url.as_deref(), &bind, port).await,
        Commands::Sweep => cmd_sweep(cli.database_url.as_deref()).await,
        Commands::Project { command } => cmd_project(cli.database_url.as_deref(), command).await,
        Commands::Agent { command } => cmd_agent(cli.database_url.as_deref(), command).await,
        Commands::User { command } => cmd_user(cli.database_url.as_deref(), command).await,
        Commands::Route { command } => cmd_route(cli.database_url.as_deref(), command).await,
    };

    if let Err(e) = result {
        eprintln!("{e:#}");
        std::process::exit(1);
    }
    Ok(())
}
