use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "coldstore-demo",
    author,
    version,
    about = "Demo CLI for the confidential storage core.",
    long_about = "Exercises provisioning, unlock, and sealed-interaction read/write against a file-backed confidential storage core."
)]
pub struct Cli {
    #[arg(long, value_name = "DIR", default_value = "./coldstore-data", help = "Directory the file-backed store persists into.")]
    pub data_dir: std::path::PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Provision a new user with a PIN.")]
    SetupPin(UserPinArgs),

    #[command(about = "Unlock a user with their PIN, caching the Master Key.")]
    Unlock(UserPinArgs),

    #[command(about = "Seal a plaintext interaction for an unlocked user.")]
    Seal(SealArgs),

    #[command(about = "Read and decrypt a sealed interaction for an unlocked user.")]
    Read(ReadArgs),

    #[command(about = "Rotate a user's Master Key, re-wrapping the DEK and PIN wrapper.")]
    Rotate(UserPinArgs),

    #[command(about = "Issue a one-time recovery code for an unlocked user.")]
    RecoveryCode(UserArgs),
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long, help = "User id.")]
    pub user: String,
}

#[derive(Debug, Args)]
pub struct UserPinArgs {
    #[arg(long, help = "User id.")]
    pub user: String,

    #[arg(long, help = "PIN.")]
    pub pin: String,
}

#[derive(Debug, Args)]
pub struct SealArgs {
    #[arg(long, help = "User id.")]
    pub user: String,

    #[arg(long, help = "Plaintext interaction body.")]
    pub text: String,
}

#[derive(Debug, Args)]
pub struct ReadArgs {
    #[arg(long, help = "User id.")]
    pub user: String,

    #[arg(long, help = "Interaction id returned by `seal`.")]
    pub id: String,
}
