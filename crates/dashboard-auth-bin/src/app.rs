//! Composition root. Every component is built once here and shared by handle.

use anyhow::{bail, Context};
use auth_engine::{ExchangeClient, OAuthCallbackServer, OAuthFlowController, TokenClass};
use credential_storage::create_file_store;
use dashboard_config_and_utils::{init_logging, Clock, Config, Paths, SystemClock};
use organization_context::{NewOrganization, OrganizationContext};
use session_lifecycle::{AuthSession, SessionState};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub struct App {
    pub config: Config,
    pub paths: Paths,
    pub oauth: OAuthFlowController,
    pub session: AuthSession,
    pub organizations: OrganizationContext,
}

/// Load configuration, start logging and wire the session.
pub fn build(base_dir: Option<PathBuf>, log_level: Option<&str>) -> anyhow::Result<App> {
    let paths = match base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;
    let config = Config::load(&paths).context("failed to load configuration")?;

    init_logging(log_level.unwrap_or(&config.log_level), &paths.logs_dir());
    info!(
        backend_url = %config.backend_url,
        base_dir = %paths.base_dir().display(),
        "Configuration loaded"
    );

    wire(config, paths)
}

fn wire(config: Config, paths: Paths) -> anyhow::Result<App> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(create_file_store(paths.credentials_file()));
    let exchange = ExchangeClient::new(&config, store.clone(), clock.clone())?;
    let oauth = OAuthFlowController::new(&config, clock.clone())?;
    let session = AuthSession::new(&config, store.clone(), exchange, oauth.clone(), clock.clone());
    let organizations = OrganizationContext::new(&config, session.clone(), store.clone(), clock)?;

    Ok(App {
        config,
        paths,
        oauth,
        session,
        organizations,
    })
}

/// Restore the stored session or fail with a hint to log in.
async fn require_session(app: &App) -> anyhow::Result<()> {
    if app.session.restore_session().await? {
        Ok(())
    } else {
        bail!("Not logged in. Run `djombi-auth login` first.")
    }
}

pub async fn login(app: &App) -> anyhow::Result<()> {
    match app.session.restore_session().await {
        Ok(true) => {
            println!("Already logged in.");
            return Ok(());
        }
        Ok(false) => {}
        Err(e) => warn!(error = %e, "Stored session unusable, starting a new login"),
    }

    let server = OAuthCallbackServer::from_config(app.oauth.clone(), &app.config)?;
    println!("Waiting for the browser at {}", server.callback_url());
    let state = app
        .session
        .login(&server, |url| {
            println!("Open this URL to sign in:\n\n  {}\n", url);
        })
        .await?;

    if state == SessionState::FullyAuthenticated {
        if let Some(user) = app.session.current_user() {
            println!("Logged in as {} <{}>", user.display_name(), user.email);
        }
    }
    Ok(())
}

pub async fn status(app: &App) -> anyhow::Result<()> {
    match app.session.restore_session().await {
        Ok(_) => {}
        Err(e) => println!("Session error: {}", e),
    }

    let state = app.session.state();
    println!("State: {}", state);
    if !state.is_authenticated() {
        return Ok(());
    }

    if let Some(user) = app.session.current_user() {
        println!("User: {} <{}> ({})", user.display_name(), user.email, user.user_id);
    }
    match app.organizations.load_organizations().await {
        Ok(_) => match app.organizations.current_organization() {
            Some(current) => println!(
                "Organization: {} ({}, {})",
                current.organization.name, current.organization_id, current.role
            ),
            None => println!("Organization: none"),
        },
        Err(e) => println!("Organization: unavailable ({})", e),
    }
    Ok(())
}

pub async fn print_token(app: &App, class: TokenClass) -> anyhow::Result<()> {
    require_session(app).await?;
    let token = app.session.access_token(class).await?;
    println!("{}", token);
    Ok(())
}

pub fn logout(app: &App) -> anyhow::Result<()> {
    app.session.logout()?;
    println!("Logged out. Credentials removed from {}", app.paths.credentials_file().display());
    Ok(())
}

pub async fn list_organizations(app: &App) -> anyhow::Result<()> {
    require_session(app).await?;
    let memberships = app.organizations.load_organizations().await?;
    if memberships.is_empty() {
        println!("No organizations.");
        return Ok(());
    }

    let current = app
        .organizations
        .current_organization()
        .map(|m| m.organization_id);
    for membership in memberships {
        let marker = if current.as_deref() == Some(membership.organization_id.as_str()) {
            "*"
        } else {
            " "
        };
        println!(
            "{} {}  {}  {}",
            marker, membership.organization_id, membership.organization.name, membership.role
        );
    }
    Ok(())
}

pub async fn switch_organization(app: &App, organization_id: &str) -> anyhow::Result<()> {
    require_session(app).await?;
    app.organizations.load_organizations().await?;
    if !app.organizations.switch_organization(organization_id).await {
        bail!(
            "Could not switch organization: {}",
            app.organizations
                .last_error()
                .unwrap_or_else(|| "unknown error".to_string())
        );
    }
    println!("Switched to {}", organization_id);
    Ok(())
}

pub async fn create_organization(
    app: &App,
    name: String,
    description: Option<String>,
) -> anyhow::Result<()> {
    require_session(app).await?;
    let new_organization = NewOrganization { name, description };
    let created = app
        .organizations
        .try_create_organization(&new_organization)
        .await?;
    println!("Created {} ({})", created.name, created.id);
    Ok(())
}
