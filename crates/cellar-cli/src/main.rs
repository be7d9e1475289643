mod bootstrap;
mod cli;
mod commands;
mod config;

use bootstrap::App;
use cellar_core::tenant::resolve_provider;
use clap::Parser;
use cli::{Cli, Command, ConfigCommand, DekCommand};
use color_eyre::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    init_tracing();

    run(cli::Cli::parse(), config::load).await
}

/// Dispatches a parsed command. The config is only loaded by commands that
/// need it, so a broken config file cannot block `version` or `provider`.
async fn run(cli: Cli, load_config: impl Fn() -> Result<config::Config>) -> Result<()> {
    let timeout_secs = cli.timeout_secs;
    let app = || -> Result<App> { App::from_config(&load_config()?, timeout_secs) };

    match cli.command {
        Command::Version => print_version(),
        Command::Config(ConfigCommand::Init) => init_config(&load_config()?)?,
        Command::Provider(arg) => println!("{}", resolve_provider(&arg.tenant)?),
        Command::MasterKey(arg) => {
            let info = commands::master_key(&app()?, &arg.tenant)?;
            println!("provider:    {}", info.provider);
            println!("key file:    {}", info.path.display());
            println!("fingerprint: {}", info.fingerprint);
        }
        Command::Dek(DekCommand::Ensure(arg)) => {
            let (provider, key_id) = commands::ensure_dek(&app()?, &arg.tenant).await?;
            println!("{} {key_id}", provider.dek_alt_name());
        }
        Command::Dek(DekCommand::Remove(arg)) => {
            let (provider, removed) = commands::remove_dek(&app()?, &arg.tenant).await?;
            if removed {
                println!("Removed {}", provider.dek_alt_name());
            } else {
                println!("No DEK registered as {}", provider.dek_alt_name());
            }
        }
        Command::Schema {
            tenant,
            field,
            bson_type,
            algorithm,
            show_keys,
            queryable,
        } => {
            let options = commands::schema(
                &app()?,
                &tenant.tenant,
                &field,
                &bson_type,
                &algorithm,
                show_keys,
                queryable,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&options)?);
        }
        Command::Encrypt {
            value,
            tenant,
            algorithm,
        } => println!(
            "{}",
            commands::encrypt(&app()?, &tenant.tenant, &value, &algorithm).await?
        ),
        Command::Decrypt { value, tenant } => {
            let plain = commands::decrypt(&app()?, &tenant.tenant, &value).await?;
            println!("{plain}");
        }
        Command::Demo(arg) => print_demo(&commands::demo(&app()?, &arg.tenant).await?)?,
    }

    Ok(())
}

fn init_tracing() {
    // Logs go to stderr so command output stays pipeable.
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

fn print_version() {
    println!("cellar {}", env!("CARGO_PKG_VERSION"));
}

fn init_config(config: &config::Config) -> Result<()> {
    let path = config::write_default_if_missing(config)?;
    println!("Config initialized at {}", path.display());
    Ok(())
}

fn print_demo(report: &commands::DemoReport) -> Result<()> {
    println!(
        "DEK {} ready for tenant {}",
        report.key_id, report.provider
    );
    println!("Inserted user with encrypted SSN (automatic encryption).");
    match &report.by_ssn {
        Some(doc) => println!("Read by SSN, decrypted: {doc}"),
        None => println!("Read by SSN found no document"),
    }
    println!("Raw stored document: {}", serde_json::to_string(&report.stored)?);
    println!("SSN (explicitly decrypted): {}", report.explicit_ssn);
    println!(
        "Read through a session without schema: {}",
        report.schemaless_read
    );
    println!(
        "Plaintext SSN filter without schema matched: {}",
        report.schemaless_ssn_matched
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use color_eyre::eyre::eyre;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).expect("parse should succeed")
    }

    #[tokio::test]
    async fn offline_commands_ignore_a_broken_config() {
        let loads = Cell::new(0);
        let broken = || -> Result<config::Config> {
            loads.set(loads.get() + 1);
            Err(eyre!("config.toml: invalid type"))
        };

        run(parse(&["cellar", "version"]), broken).await.expect("version");
        run(parse(&["cellar", "provider", "org/7"]), broken)
            .await
            .expect("provider");
        assert_eq!(loads.get(), 0);
    }

    #[tokio::test]
    async fn vault_commands_surface_config_errors() {
        let broken = || -> Result<config::Config> { Err(eyre!("config.toml: invalid type")) };

        let err = run(parse(&["cellar", "dek", "ensure", "org/7"]), broken)
            .await
            .expect_err("needs config");
        assert!(err.to_string().contains("config.toml"));
        assert!(run(parse(&["cellar", "config", "init"]), broken).await.is_err());
    }
}
