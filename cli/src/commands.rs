use anyhow::{bail, Context, Result};
use sinetstream_client::{ClientSettings, DeviceKey, Outcome, Session};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// `<config dir>/sinetstream/device.pem`
pub fn default_key_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("sinetstream").join("device.pem"))
}

fn open_session(settings: &ClientSettings) -> Result<Session> {
    Session::open(settings).context("Failed to open session (check --auth and --key)")
}

async fn logged_in(settings: &ClientSettings) -> Result<Session> {
    let mut session = open_session(settings)?;
    session.login().await.context("Token exchange failed")?;
    Ok(session)
}

pub fn keygen(out: &Path, bits: usize, force: bool) -> Result<()> {
    if out.exists() && !force {
        bail!("{} already exists; pass --force to overwrite it", out.display());
    }
    if let Some(parent) = out.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let key = DeviceKey::generate(bits)?;
    key.save(out)?;
    info!("Wrote private key to {}", out.display());

    println!("fingerprint: {}", key.fingerprint());
    println!("public key:  {}", key.public_key_base64());
    Ok(())
}

pub async fn token(settings: &ClientSettings) -> Result<()> {
    let session = open_session(settings)?;
    let operation = session.begin_login();
    let cancel = operation.cancel_handle();

    let mut wait = std::pin::pin!(operation.wait());
    let outcome = tokio::select! {
        outcome = &mut wait => outcome,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            wait.await
        }
    };

    let grant = match outcome {
        Outcome::Completed(grant) => grant,
        Outcome::Failed(err) => return Err(err).context("Token exchange failed"),
        Outcome::Cancelled => bail!("Interrupted"),
    };
    match grant.access_token.expires_at() {
        Some(at) => println!("access token valid until {}", at.to_rfc3339()),
        None => println!("access token obtained (no expiry reported)"),
    }
    Ok(())
}

pub async fn register_key(settings: &ClientSettings, comment: Option<&str>, is_default: bool) -> Result<()> {
    let mut session = logged_in(settings).await?;
    let key = session.register_device_key(comment, is_default).await?;
    println!("registered key {} ({})", key.id, key.fingerprint);

    let local = session.keyring().default_key().map(|k| k.fingerprint().to_string());
    if local.as_deref() != Some(key.fingerprint.as_str()) {
        warn!(
            "Server fingerprint {} differs from the local one; later runs cannot match secrets wrapped for it",
            key.fingerprint
        );
    }
    Ok(())
}

pub async fn list_keys(settings: &ClientSettings) -> Result<()> {
    let session = logged_in(settings).await?;
    let token = session.token().context("No access token")?;
    let keys = session.client().list_public_keys(token).await?;

    if keys.is_empty() {
        println!("no keys registered");
        return Ok(());
    }
    for key in keys {
        let local = session
            .keyring()
            .get(Some(key.fingerprint.as_str()))
            .map(|_| " (this device)")
            .unwrap_or("");
        println!(
            "{:>6} {} {}{} {} {}",
            key.id,
            if key.is_default { "*" } else { " " },
            key.fingerprint,
            local,
            key.created_at.format("%Y-%m-%d"),
            key.comment.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

pub async fn delete_keys(settings: &ClientSettings, id: Option<i64>, all: bool) -> Result<()> {
    if id.is_none() && !all {
        bail!("Give a key id, or --all to delete every key");
    }
    let session = logged_in(settings).await?;
    let token = session.token().context("No access token")?;
    session.client().delete_public_keys(token, id).await?;

    match id {
        Some(id) => println!("deleted key {}", id),
        None => println!("deleted all keys"),
    }
    Ok(())
}

pub async fn list_configs(settings: &ClientSettings) -> Result<()> {
    let session = logged_in(settings).await?;
    let token = session.token().context("No access token")?;
    for name in session.client().list_configs(token).await? {
        println!("{}", name);
    }
    Ok(())
}

pub async fn fetch(settings: &ClientSettings, name: &str, show_secrets: bool) -> Result<()> {
    let mut session = logged_in(settings).await?;
    let merged = session
        .download(name)
        .await
        .with_context(|| format!("Failed to assemble configuration {}", name))?;

    let rendered = if show_secrets {
        merged.to_nested()
    } else {
        merged.redacted()
    };
    println!("{}", serde_json::to_string_pretty(&rendered)?);

    let hidden = merged.secret_paths().count();
    if hidden > 0 && !show_secrets {
        info!("{} secret values redacted; pass --show-secrets to print them", hidden);
    }
    Ok(())
}
