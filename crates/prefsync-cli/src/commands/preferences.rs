use prefsync_config::Origin;
use tracing::info;

use crate::commands::Session;
use crate::error::{CliError, CliResult};
use crate::output::{OutputFormat, render_commit, render_item, render_items, render_keys};

const CLI_SOURCE: &str = "cli";

pub(crate) fn handle_show(session: &Session, format: OutputFormat) -> CliResult<String> {
    let items = session.view.project(&session.store.snapshot());
    render_items(&items, format)
}

pub(crate) fn handle_get(session: &Session, key: &str, format: OutputFormat) -> CliResult<String> {
    let item = session
        .view
        .project_item(&session.store.snapshot(), key)
        .ok_or_else(|| CliError::validation(format!("{key}: unknown preference key")))?;
    render_item(&item, format)
}

pub(crate) async fn handle_set(session: Session, key: &str, raw: &str) -> CliResult<String> {
    let request = session.view.on_user_edit(key, raw)?;
    let snapshot = session.store.apply(request)?;
    info!(key, revision = snapshot.revision(), "preference updated");
    let item = session.view.project_item(&snapshot, key);
    session.close().await?;
    Ok(render_commit(&snapshot, item.as_ref()))
}

pub(crate) async fn handle_reset(session: Session) -> CliResult<String> {
    let snapshot = session.store.reset_all(Origin::system(CLI_SOURCE));
    session.close().await?;
    Ok(render_commit(&snapshot, None))
}

pub(crate) fn handle_keys(session: &Session, format: OutputFormat) -> CliResult<String> {
    render_keys(session.store.schema().settings(), format)
}
