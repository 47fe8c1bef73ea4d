use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use archivist_host::{
    bootstrap, spawn_record_listener, ArchiveLoader, ArchiveRegistry, DirectorySource,
    RecordStore,
};
use archivist_server::{AppState, ArchivistConfig, ArchivistServer};
use archivist_store::FsStorageBackend;
use archivist_swarm::{SwarmReplicator, TcpSwarm};
use archivist_types::ArchiveKey;
use colored::Colorize;

use crate::cli::{Cli, Command, KeyAction, ServeArgs};

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve(args) => {
            let config = resolve_config(cli.config.as_deref(), &args)?;
            let runtime = tokio::runtime::Runtime::new().context("failed to start runtime")?;
            runtime.block_on(cmd_serve(config))
        }
        Command::Key(args) => cmd_key(args.action),
        Command::Config => {
            let config = resolve_config(cli.config.as_deref(), &ServeArgs::default())?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// File values (or defaults), then command-line overrides.
fn resolve_config(path: Option<&Path>, args: &ServeArgs) -> anyhow::Result<ArchivistConfig> {
    let mut config = match path {
        Some(path) => ArchivistConfig::load(path)?,
        None => ArchivistConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(storage) = &args.storage {
        config.storage_root = storage.clone();
    }
    if let Some(listen) = args.swarm_listen {
        config.swarm.listen_addr = listen;
    }
    if !args.peers.is_empty() {
        config.swarm.bootstrap = args.peers.clone();
    }
    if args.no_swarm {
        config.swarm.enabled = false;
    }
    Ok(config)
}

async fn cmd_serve(config: ArchivistConfig) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.storage_root)
        .await
        .with_context(|| format!("failed to create {}", config.storage_root.display()))?;

    let replicator = if config.swarm.enabled {
        let swarm = TcpSwarm::bind(&config.swarm)
            .await
            .context("failed to start swarm")?;
        println!("{} swarm on {}", "✓".green(), swarm.local_addr().to_string().bold());
        SwarmReplicator::new(Arc::new(swarm)).with_handshake_timeout(config.swarm.handshake_timeout())
    } else {
        println!("{} swarm disabled, archives stay local", "!".yellow());
        SwarmReplicator::disabled()
    };

    let loader = ArchiveLoader::new(&config.storage_root, Arc::new(FsStorageBackend::new()));
    let registry = ArchiveRegistry::new(loader, replicator);
    let records = Arc::new(RecordStore::in_memory());
    spawn_record_listener(registry.clone(), &records);

    let state = AppState::new(registry.clone(), records);
    let done = state.bootstrapped.clone();
    let source = DirectorySource::new(&config.storage_root);
    tokio::spawn(async move {
        bootstrap(&registry, &source, &done).await;
    });

    println!(
        "{} archivist on {} (storage: {})",
        "✓".green().bold(),
        config.bind_addr.to_string().bold(),
        config.storage_root.display()
    );
    ArchivistServer::new(config, state).serve().await?;
    Ok(())
}

fn cmd_key(action: KeyAction) -> anyhow::Result<()> {
    match action {
        KeyAction::Generate => {
            println!("{}", ArchiveKey::generate().to_hex());
        }
        KeyAction::Discovery { key } => {
            let key: ArchiveKey = key.parse().context("invalid archive key")?;
            println!("{}  {}", key.short_id().yellow(), key.discovery_key().to_hex());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::path::PathBuf;

    #[test]
    fn defaults_without_file_or_flags() {
        let config = resolve_config(None, &ServeArgs::default()).unwrap();
        assert_eq!(config, ArchivistConfig::default());
    }

    #[test]
    fn flags_override_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("archivist.toml");
        std::fs::write(
            &path,
            "bind_addr = \"127.0.0.1:7000\"\nstorage_root = \"/data\"\n",
        )
        .unwrap();

        let args = ServeArgs {
            storage: Some(PathBuf::from("/override")),
            no_swarm: true,
            ..Default::default()
        };
        let config = resolve_config(Some(&path), &args).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:7000".parse::<SocketAddr>().unwrap());
        assert_eq!(config.storage_root, PathBuf::from("/override"));
        assert!(!config.swarm.enabled);
    }

    #[test]
    fn missing_file_is_an_error() {
        let args = ServeArgs::default();
        assert!(resolve_config(Some(Path::new("/nonexistent.toml")), &args).is_err());
    }

    #[test]
    fn discovery_rejects_bad_key() {
        assert!(cmd_key(KeyAction::Discovery { key: "zz".into() }).is_err());
    }
}
