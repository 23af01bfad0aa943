//! Wires settings into a client and runs one command.

use std::path::PathBuf;
use std::sync::Arc;

use kitebroker_api::{Client, PasswordGrant, SignatureGrant, TokenSource};
use kitebroker_kiteworks::{Kiteworks, KiteworksErrorScanner};
use kitebroker_store::JsonDatabase;

use crate::config::Settings;

/// Password for interactive grants when no signature secret is configured.
const PASSWORD_ENV: &str = "KITEBROKER_PASSWORD";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Authenticates and lists the top-level folders.
    Check,
    List { folder: String },
    Get { file: String, dest: PathBuf },
    Put { folder: String, source: PathBuf },
    Logout,
}

impl Command {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Self> {
        let args: Vec<String> = args.into_iter().collect();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(match args.as_slice() {
            [] | ["check"] => Command::Check,
            ["ls", folder] => Command::List {
                folder: folder.to_string(),
            },
            ["get", file, dest] => Command::Get {
                file: file.to_string(),
                dest: PathBuf::from(dest),
            },
            ["put", folder, source] => Command::Put {
                folder: folder.to_string(),
                source: PathBuf::from(source),
            },
            ["logout"] => Command::Logout,
            _ => anyhow::bail!(
                "usage: kitebroker [check | ls <folder-id> | get <file-id> <dest> | put <folder-id> <file> | logout]"
            ),
        })
    }
}

fn token_source(settings: &Settings) -> Option<Arc<dyn TokenSource>> {
    if !settings.signature_secret.is_empty() {
        return Some(Arc::new(SignatureGrant));
    }
    std::env::var(PASSWORD_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(|p| Arc::new(PasswordGrant::new(p)) as Arc<dyn TokenSource>)
}

pub fn build_client(settings: &Settings) -> anyhow::Result<Client> {
    let mut builder = Client::builder(settings.client_config()?)
        .error_scanner(Arc::new(KiteworksErrorScanner))
        .call_limit(settings.call_limit)
        .transfer_limit(settings.transfer_limit);

    if settings.database.is_empty() {
        tracing::debug!("no database configured, tokens are kept in memory");
    } else if settings.database_key.is_empty() {
        tracing::warn!("database_key is empty, tokens are kept in memory");
    } else {
        let db = JsonDatabase::open(PathBuf::from(&settings.database), &settings.database_key)?;
        builder = builder.database(Arc::new(db));
    }

    if let Some(source) = token_source(settings) {
        builder = builder.token_source(source);
    }
    Ok(builder.build()?)
}

pub async fn run(settings: Settings, command: Command) -> anyhow::Result<()> {
    let client = build_client(&settings)?;
    let kw = Kiteworks::new(client.session(settings.username.clone()));

    match command {
        Command::Check => {
            let me = kw.my_user().await?;
            tracing::info!(id = %me.id, email = %me.email, "authenticated");
            for folder in kw.top_folders().await? {
                println!("{}\t{}", folder.id, folder.name);
            }
        }
        Command::List { folder } => {
            let contents = kw.folder_contents(&folder).await?;
            for f in &contents.folders {
                println!("d\t{}\t{}", f.id, f.name);
            }
            for f in &contents.files {
                println!("f\t{}\t{}\t{}", f.id, f.size, f.name);
            }
        }
        Command::Get { file, dest } => {
            let file = kw.file(&file).await?;
            let dest = if dest.is_dir() { dest.join(&file.name) } else { dest };
            let written = kw.download_file(&file, &dest).await?;
            tracing::info!(path = %dest.display(), bytes = written, "saved");
        }
        Command::Put { folder, source } => {
            let file = kw.upload_file(&folder, &source, true).await?;
            println!("{}\t{}", file.id, file.name);
        }
        Command::Logout => {
            kw.session().logout().await?;
            tracing::info!(user = %settings.username, "credential removed");
        }
    }
    Ok(())
}
