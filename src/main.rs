use anyhow::Result;
use tokio_util::sync::CancellationToken;

use dashboard_session::auth::{InitOutcome, Session, SessionManager};
use dashboard_session::config::{self, Command, Config, LogFormat, ShellCommand};
use dashboard_session::http_client::ApiRequest;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    init_logging(&config);

    tracing::info!(
        "Dashboard session client v{} ({})",
        env!("CARGO_PKG_VERSION"),
        config.api_url
    );

    let manager = SessionManager::new(&config)?;

    let result = match config.command.clone() {
        Command::Shell => run_shell(&manager).await,
        command => tokio::select! {
            result = run_once(&manager, command) => result,
            _ = shutdown_signal() => {
                tracing::info!("Interrupted");
                Ok(())
            }
        },
    };

    // The refresh cookie dies with this process; let the backend revoke it
    if manager.state().is_authenticated() {
        manager.logout().await;
    }

    result
}

/// Initialize logging with the configured level and format
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run_once(manager: &SessionManager, command: Command) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let session = sign_in(manager, &email, password).await?;
            print_session(&session)
        }
        Command::Get {
            path,
            email,
            password,
        } => {
            sign_in(manager, &email, password).await?;
            get(manager, &path).await
        }
        Command::Shell => run_shell(manager).await,
    }
}

async fn run_shell(manager: &SessionManager) -> Result<()> {
    println!("Commands: {}", ShellCommand::HELP);

    loop {
        // End of input closes the shell
        let Ok(line) = tokio::task::block_in_place(config::prompt_shell_line) else {
            return Ok(());
        };

        let command = match ShellCommand::parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{}", e);
                continue;
            }
        };

        let result = match command {
            ShellCommand::Quit => return Ok(()),
            ShellCommand::Help => {
                println!("Commands: {}", ShellCommand::HELP);
                Ok(())
            }
            ShellCommand::Login { email } => sign_in(manager, &email, None)
                .await
                .and_then(|session| print_session(&session)),
            ShellCommand::Get { path } => get(manager, &path).await,
            ShellCommand::Whoami => match manager.state().session() {
                Some(session) => print_session(session),
                None => {
                    println!("Not signed in");
                    Ok(())
                }
            },
            ShellCommand::Profile => match manager.refresh_profile().await {
                Ok(session) => print_session(&session),
                Err(e) => Err(anyhow::anyhow!("{}", e.user_message())),
            },
            ShellCommand::Restore => restore(manager).await,
            ShellCommand::Logout => {
                manager.logout().await;
                println!("Signed out");
                Ok(())
            }
        };

        if let Err(e) = result {
            eprintln!("{}", e);
        }
    }
}

async fn sign_in(
    manager: &SessionManager,
    email: &str,
    password: Option<String>,
) -> Result<Session> {
    let password = match password {
        Some(p) => p,
        None => tokio::task::block_in_place(|| config::prompt_password(email))?,
    };

    manager
        .login(email, &password)
        .await
        .map_err(|e| anyhow::anyhow!("Login failed: {}", e))
}

async fn get(manager: &SessionManager, path: &str) -> Result<()> {
    match manager.request(ApiRequest::get(path)).await {
        Ok(response) => {
            println!("{}", response.text());
            Ok(())
        }
        Err(e) => {
            tracing::error!(path = %path, error = %e, "Request failed");
            anyhow::bail!("{}", e.user_message())
        }
    }
}

/// Renew from the refresh cookie held in this process's jar
async fn restore(manager: &SessionManager) -> Result<()> {
    match manager.initializer().run(CancellationToken::new()).await {
        InitOutcome::Restored(session) => print_session(&session),
        InitOutcome::NoSession => {
            println!("No session to restore");
            Ok(())
        }
        InitOutcome::Deferred(e) => anyhow::bail!("Restore deferred: {}", e.user_message()),
        InitOutcome::Cancelled => Ok(()),
    }
}

fn print_session(session: &Session) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(session)?);
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
