use clap::{Args, Parser, Subcommand};

/// Tenant tag used when none is given, matching the sample organisation.
pub const DEFAULT_TENANT: &str = "don:identity:dvrv-us-1:devo/10";

#[derive(Parser, Debug)]
#[command(
    name = "cellar",
    about = "Per-tenant envelope encryption keys: master keys, DEKs and encryption sessions",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Give up on the command's vault work after this many seconds in total.
    /// The budget starts when the command starts and covers every vault call it makes.
    #[arg(long, global = true, value_name = "SECS")]
    pub timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct TenantArg {
    /// Tenant identifier; the segment after the last `/` names the provider.
    #[arg(default_value = DEFAULT_TENANT)]
    pub tenant: String,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the KMS provider name for a tenant identifier.
    Provider(TenantArg),
    /// Load or create the tenant's master key and print its fingerprint.
    MasterKey(TenantArg),
    /// Manage the tenant's data encryption key.
    #[command(subcommand)]
    Dek(DekCommand),
    /// Print the auto-encryption options for one encrypted field.
    Schema {
        #[command(flatten)]
        tenant: TenantArg,
        /// `database.collection.field` to encrypt.
        #[arg(long, default_value = "csfle_db.users.ssn")]
        field: String,
        #[arg(long, default_value = "string")]
        bson_type: String,
        /// `deterministic` or `random`.
        #[arg(long, default_value = "deterministic")]
        algorithm: String,
        /// Include raw master key bytes in the output.
        #[arg(long)]
        show_keys: bool,
        /// Also declare the queryable-encryption fields of `qe_db.users`
        /// (`ssn` equality, `age` range, `email`) under the tenant's DEK.
        #[arg(long)]
        queryable: bool,
    },
    /// Encrypt a value with the tenant's DEK and print it as base64.
    Encrypt {
        /// JSON value; anything that is not valid JSON is taken as a string.
        value: String,
        #[command(flatten)]
        tenant: TenantArg,
        #[arg(long, default_value = "deterministic")]
        algorithm: String,
    },
    /// Decrypt a base64 value produced by `encrypt` or read from a document.
    Decrypt {
        value: String,
        #[command(flatten)]
        tenant: TenantArg,
    },
    /// Write, query and read back a user document end to end.
    Demo(TenantArg),
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print version and exit.
    Version,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum DekCommand {
    /// Return the tenant's DEK id, creating the DEK if the vault has none.
    Ensure(TenantArg),
    /// Delete the tenant's DEK. Values encrypted under it become unreadable.
    Remove(TenantArg),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}
