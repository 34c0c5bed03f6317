#![allow(clippy::uninlined_format_args)]

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use autologin::login::DetectionOutcome;
use autologin::{
    AttemptSettings, Browser, BrowserOptions, BrowserType, ConfigSet, Credentials,
    DetectionMetricsRecorder, LoginError, LoginOutcome, LoginSession, OutputFormat, RetryPolicy,
    ViewportSize,
};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_COMMAND_ERROR: i32 = 1;
const EXIT_FORM_NOT_FOUND: i32 = 2;
const EXIT_WEBDRIVER_FAILED: i32 = 4;

#[derive(Parser)]
#[command(name = "autologin")]
#[command(about = "Automated sign-in for web login forms", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Log into a site
    Login {
        /// Login page URL
        url: String,

        /// Username or email
        #[arg(short, long)]
        username: String,

        /// Password (prefer --password-env)
        #[arg(short, long, conflicts_with = "password_env")]
        password: Option<String>,

        /// Read the password from this environment variable
        #[arg(long)]
        password_env: Option<String>,

        /// Domain to select; "none" skips all domain handling
        #[arg(short, long)]
        domain: Option<String>,

        /// Retries after the first attempt for transient failures
        #[arg(long, default_value = "3")]
        retries: u32,

        /// Overall time limit in seconds, retries included
        #[arg(long)]
        timeout: Option<u64>,

        #[command(flatten)]
        browser: BrowserArgs,
    },

    /// Detect the login form without logging in
    Detect {
        /// Login page URL
        url: String,

        #[command(flatten)]
        browser: BrowserArgs,
    },
}

#[derive(Args)]
struct BrowserArgs {
    /// Browser to use
    #[arg(short, long, value_enum, default_value = "firefox")]
    browser: BrowserType,

    /// Run browser in visible mode (disables headless)
    #[arg(long = "no-headless")]
    no_headless: bool,

    /// Set viewport size (WIDTHxHEIGHT, e.g., 1920x1080)
    #[arg(long)]
    viewport: Option<String>,

    /// WebDriver URL (defaults to localhost:4444 for Firefox, localhost:9515 for Chrome)
    #[arg(long)]
    webdriver_url: Option<String>,

    /// Site configuration file (defaults to ~/.autologin/sites.json if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "json")]
    format: OutputFormat,
}

impl BrowserArgs {
    fn options(&self) -> Result<BrowserOptions> {
        let viewport = self
            .viewport
            .as_deref()
            .map(ViewportSize::parse)
            .transpose()?;
        Ok(BrowserOptions {
            browser_type: self.browser,
            webdriver_url: self.webdriver_url.clone(),
            viewport,
            headless: !self.no_headless,
        })
    }

    fn load_configs(&self) -> Result<ConfigSet> {
        if let Some(path) = &self.config {
            return Ok(ConfigSet::from_path(path)?);
        }
        match ConfigSet::default_path() {
            Some(path) if path.exists() => Ok(ConfigSet::from_path(&path)?),
            _ => {
                debug!("No site configuration file; relying on heuristics");
                Ok(ConfigSet::empty())
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let result = run().await;

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            let exit_code = exit_code_for(&err);

            // Output JSON error to stdout for programmatic consumption
            let error_json = json!({
                "error": true,
                "message": format!("{:#}", err),
                "exit_code": exit_code
            });
            println!(
                "{}",
                serde_json::to_string(&error_json).unwrap_or_else(|_| "{}".to_string())
            );

            // Also log to stderr for human reading
            eprintln!("Error: {:#}", err);
            std::process::exit(exit_code);
        }
    }
}

/// Map errors that escaped the login engine to exit codes
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(login_err) = err.downcast_ref::<LoginError>() {
        return login_err.exit_code();
    }
    let message = format!("{:#}", err).to_lowercase();
    if message.contains("webdriver") || message.contains("geckodriver") || message.contains("chromedriver") {
        EXIT_WEBDRIVER_FAILED
    } else {
        EXIT_COMMAND_ERROR
    }
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();

    let default_filter = match cli.verbose {
        0 => "autologin=warn",
        1 => "autologin=debug",
        _ => "autologin=trace",
    };

    // Initialize tracing to stderr (so JSON output to stdout remains clean)
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .init();

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    match cli.command {
        Commands::Login {
            url,
            username,
            password,
            password_env,
            domain,
            retries,
            timeout,
            browser,
        } => {
            let password = resolve_password(password, password_env.as_deref())?;
            let mut credentials = Credentials::new(username, password);
            credentials.domain = domain;

            let configs = browser.load_configs()?;
            let settings = AttemptSettings {
                retry: RetryPolicy::new(retries),
                overall_timeout: timeout.map(Duration::from_secs),
                ..Default::default()
            };

            let page = Browser::connect(browser.options()?).await?;
            let metrics = DetectionMetricsRecorder::new();
            let session = LoginSession::new(&page, &configs, settings)
                .with_metrics(&metrics)
                .with_cancellation(cancel);

            let result = session.login(&url, &credentials).await;
            close_browser(page).await;

            let outcome = result?;
            print_login(&outcome, browser.format)?;
            Ok(outcome.exit_code)
        }
        Commands::Detect { url, browser } => {
            let configs = browser.load_configs()?;
            let page = Browser::connect(browser.options()?).await?;
            let session = LoginSession::new(&page, &configs, AttemptSettings::default())
                .with_cancellation(cancel);

            let result = session.detect_only(&url).await;
            close_browser(page).await;

            let outcome = result?;
            print_detection(&outcome, browser.format)?;
            Ok(if outcome.found {
                EXIT_SUCCESS
            } else {
                EXIT_FORM_NOT_FOUND
            })
        }
    }
}

fn resolve_password(password: Option<String>, password_env: Option<&str>) -> Result<String> {
    if let Some(password) = password {
        return Ok(password);
    }
    let var = password_env.context("A password is required: pass --password or --password-env")?;
    std::env::var(var).with_context(|| format!("Environment variable {} is not set", var))
}

fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling login attempt");
            cancel.cancel();
        }
    });
}

async fn close_browser(page: Browser) {
    if let Err(e) = page.close().await {
        debug!("Could not close browser session: {}", e);
    } else {
        info!("Browser session closed");
    }
}

fn print_login(outcome: &LoginOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
        OutputFormat::Simple => {
            let status = if outcome.success { "SUCCESS" } else { "FAILED" };
            println!("{} {} ({:?})", status, outcome.url, outcome.kind);
            println!("Attempts: {}, elapsed: {}ms", outcome.attempts, outcome.elapsed_ms);
            if let Some(detection) = &outcome.last_attempt.detection {
                println!(
                    "Form: method={}, confidence={}",
                    detection.method.map(|m| m.as_str()).unwrap_or("none"),
                    detection.confidence
                );
            }
            if let Some(assessment) = &outcome.last_attempt.assessment {
                println!(
                    "Verification: {} (confidence {})",
                    assessment.reason, assessment.confidence
                );
            }
            if let Some(message) = &outcome.message {
                println!("Error: {}", message);
            }
        }
    }
    Ok(())
}

fn print_detection(outcome: &DetectionOutcome, format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(outcome)?),
        OutputFormat::Simple => {
            let d = &outcome.detection;
            let mark = |found: bool| if found { "yes" } else { "no" };
            println!("URL: {}", outcome.url);
            println!(
                "Login form: {} (method={}, confidence={})",
                mark(outcome.found),
                d.method.map(|m| m.as_str()).unwrap_or("none"),
                d.confidence
            );
            println!(
                "Fields: username={} password={} domain={} submit={}",
                mark(d.username),
                mark(d.password),
                mark(d.domain),
                mark(d.submit)
            );
            if d.context_depth > 0 {
                println!("Nested {} level(s) deep", d.context_depth);
            }
        }
    }
    Ok(())
}
