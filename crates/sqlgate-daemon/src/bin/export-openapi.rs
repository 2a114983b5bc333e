use std::{env, fs, path::Path};

use anyhow::{Context, Result};
use sqlgate_daemon::server::docs::ApiDoc;
use utoipa::OpenApi;

fn main() -> Result<()> {
    let output = env::args().nth(1);
    let openapi = ApiDoc::openapi();
    let json = openapi
        .to_pretty_json()
        .context("failed to serialise OpenAPI")?;

    if let Some(path) = output {
        let path = Path::new(&path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("failed to create directory for {}", path.display())
                })?;
            }
        }
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    } else {
        println!("{json}");
    }

    Ok(())
}
