mod cli;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::Parser;

use coldproxy_confidential_store::config::CoreConfig;
use coldproxy_confidential_store::encryptor::PlaintextInteraction;
use coldproxy_confidential_store::persistence::PersistenceAdapter;
use coldproxy_confidential_store::persistence::file::FilePersistence;
use coldproxy_confidential_store::ConfidentialStore;

use cli::{Cli, Commands};

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock before epoch").as_secs()
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let store: Arc<dyn PersistenceAdapter> = match FilePersistence::new(&cli.data_dir) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("error: could not open data directory {:?}: {err}", cli.data_dir);
            return ExitCode::FAILURE;
        }
    };
    let core = ConfidentialStore::new(store, CoreConfig::default());

    match run(&core, cli.command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(msg) => {
            eprintln!("error: {msg}");
            ExitCode::FAILURE
        }
    }
}

async fn run(core: &ConfidentialStore, command: Commands) -> Result<(), String> {
    match command {
        Commands::SetupPin(args) => {
            core.setup().set_pin(&args.user, &args.pin).await.map_err(|e| e.to_string())?;
            println!("provisioned user {:?}", args.user);
            Ok(())
        }
        Commands::Unlock(args) => {
            if core.unlock().unlock_with_pin(&args.user, &args.pin).await {
                println!("unlocked");
                Ok(())
            } else {
                Err("invalid PIN or account locked".to_string())
            }
        }
        Commands::Seal(args) => {
            let input = PlaintextInteraction {
                user_id: args.user.clone(),
                model: None,
                tokens: None,
                cost_usd: None,
                plaintext: args.text.into_bytes(),
                request_fingerprint: None,
                truncated: false,
            };
            let id = core.seal_interaction(&args.user, now_unix(), input).await.map_err(|e| e.to_string())?;
            println!("{id}");
            Ok(())
        }
        Commands::Read(args) => {
            let plaintext = core.read_interaction(&args.user, &args.id).await.map_err(|e| e.to_string())?;
            println!("{}", String::from_utf8_lossy(&plaintext));
            Ok(())
        }
        Commands::Rotate(args) => {
            if !core.unlock().unlock_with_pin(&args.user, &args.pin).await {
                return Err("cannot rotate: PIN rejected".to_string());
            }
            core.rotate_master_key(&args.user, &args.pin).await.map_err(|e| e.to_string())?;
            println!("rotated master key for {:?}", args.user);
            Ok(())
        }
        Commands::RecoveryCode(args) => {
            let code = core.generate_recovery_code(&args.user).await.map_err(|e| {
                format!("{e} (unlock the user with `unlock` first; a recovery code can only be issued while the Master Key is cached)")
            })?;
            println!("{code}");
            Ok(())
        }
    }
}
