//! Doorway Wormhole - operator CLI for agent identities and key bundles

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use doorway_wormhole::{
    config::{Args, Command},
    identity::IdentityDeriver,
    keypair::{AgentIdentity, Keypair, PersistenceBundle},
    primitives::{self, Assurance},
    SaltServiceClient,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("doorway_wormhole={},info", args.log_level).into());
    let (json_layer, text_layer) = if args.log_json {
        (Some(tracing_subscriber::fmt::layer().json()), None)
    } else {
        (None, Some(tracing_subscriber::fmt::layer()))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .init();

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    let primitives = primitives::ready().context("Crypto primitives unavailable")?;
    if primitives.assurance() == Assurance::Reduced {
        warn!("Running with reduced-assurance local entropy");
    }

    let client = Arc::new(
        SaltServiceClient::with_timeout(
            args.salt_service_url.clone(),
            Duration::from_millis(args.request_timeout_ms),
        )
        .context("Failed to build salt service client")?,
    );
    let deriver = IdentityDeriver::new(client.clone(), client);

    info!(salt_service = %args.salt_service_url, happ_id = %args.happ_id, "Doorway Wormhole");

    match args.command {
        Command::Readonly => {
            let keypair = deriver.derive_readonly().await?;
            println!("{}", keypair.identity());
        }

        Command::Signup { email, password } => {
            let registration = deriver.derive_new_readwrite(&email, &password).await?;
            println!("{}", registration.keypair.identity());
            if !registration.salt_registration.is_registered() {
                warn!("Salt was not registered; this identity may not be recoverable");
            }
        }

        Command::Login {
            email,
            password,
            expect,
        } => {
            let keypair = match expect {
                Some(expected) => {
                    let expected: AgentIdentity = expected.parse()?;
                    deriver
                        .regenerate_verified(&email, &password, &expected)
                        .await?
                }
                None => deriver.regenerate(&email, &password).await?,
            };
            println!("{}", keypair.identity());
        }

        Command::ExportBundle {
            email,
            password,
            passphrase,
            hint,
            out,
        } => {
            let keypair = deriver.regenerate(&email, &password).await?;
            let bundle = keypair.get_bundle(&passphrase, hint).await?;

            let json = serde_json::to_string_pretty(&bundle)?;
            tokio::fs::write(&out, json)
                .await
                .with_context(|| format!("Failed to write {}", out.display()))?;
            info!(path = %out.display(), "Wrote keypair bundle");
        }

        Command::InspectBundle { path, passphrase } => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let bundle: PersistenceBundle = serde_json::from_str(&raw)?;

            let keypair = Keypair::from_bundle(&bundle, &passphrase).await?;
            println!("{}", keypair.identity());
            info!(
                private_keys = keypair.has_private_keys(),
                "Bundle decrypted"
            );
        }
    }

    Ok(())
}
