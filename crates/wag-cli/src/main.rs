//! `wag`: administrative CLI.
//!
//! A thin client over the daemon's control socket. Each verb takes exactly
//! one action flag; list output is CSV for scripting, everything else
//! prints `OK` on success and exits non-zero on error.

use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use clap::ArgGroup;
use clap::Args;
use clap::Parser;
use clap::Subcommand;
use wag_control::socket_path;
use wag_control::ControlClient;
use wag_control::TokenRequest;

#[derive(Parser)]
#[command(name = "wag", about = "Manage a running wag gateway", version)]
struct Cli {
    /// Control socket path (defaults to the daemon's fixed socket).
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage user accounts.
    Users(UsersArgs),
    /// Manage registered devices.
    Devices(DevicesArgs),
    /// Manage registration tokens.
    Tokens(TokensArgs),
    /// Inspect the firewall state.
    Firewall(FirewallArgs),
}

#[derive(Args)]
#[command(group(ArgGroup::new("action").required(true).args(["del", "list", "lock", "unlock", "reset_mfa"])))]
struct UsersArgs {
    /// Username to act upon (optional filter with --list).
    #[arg(long)]
    username: Option<String>,

    /// Delete the user and every associated device.
    #[arg(long)]
    del: bool,

    /// List users as CSV.
    #[arg(long)]
    list: bool,

    /// Lock the account and deauthenticate all active sessions.
    #[arg(long)]
    lock: bool,

    /// Unlock a locked account.
    #[arg(long)]
    unlock: bool,

    /// Reset MFA details, invalidating every session.
    #[arg(long = "reset-mfa")]
    reset_mfa: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("action").required(true).args(["del", "list", "block"])))]
struct DevicesArgs {
    /// Device tunnel address.
    #[arg(long)]
    address: Option<String>,

    /// Filter --list by owner.
    #[arg(long)]
    username: Option<String>,

    /// Remove the device entirely.
    #[arg(long)]
    del: bool,

    /// List devices as CSV.
    #[arg(long)]
    list: bool,

    /// Drop the device's authorised session.
    #[arg(long)]
    block: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("action").required(true).args(["del", "list", "add"])))]
struct TokensArgs {
    /// Token string (generated for --add when omitted).
    #[arg(long)]
    token: Option<String>,

    /// Owner of the enrolled device.
    #[arg(long)]
    username: Option<String>,

    /// Address of an existing device whose key the enrolment rotates.
    #[arg(long)]
    overwrites: Option<String>,

    /// Group applied on use; repeatable.
    #[arg(long = "group")]
    groups: Vec<String>,

    /// Number of uses before the token is destroyed.
    #[arg(long, default_value_t = 1)]
    uses: u32,

    /// Delete a token.
    #[arg(long)]
    del: bool,

    /// List tokens as CSV.
    #[arg(long)]
    list: bool,

    /// Create a token.
    #[arg(long)]
    add: bool,
}

#[derive(Args)]
#[command(group(ArgGroup::new("action").required(true).args(["list"])))]
struct FirewallArgs {
    /// Dump the installed rules as JSON.
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = ControlClient::new(socket_path(cli.socket.as_deref()));

    match cli.command {
        Command::Users(args) => users(&client, args).await,
        Command::Devices(args) => devices(&client, args).await,
        Command::Tokens(args) => tokens(&client, args).await,
        Command::Firewall(args) => firewall(&client, args).await,
    }
}

fn require<T>(value: Option<T>, flag: &str) -> anyhow::Result<T> {
    match value {
        Some(value) => Ok(value),
        None => bail!("{flag} must be supplied"),
    }
}

async fn users(client: &ControlClient, args: UsersArgs) -> anyhow::Result<()> {
    if args.list {
        let users = client.list_users(args.username.as_deref()).await?;
        println!("username,locked,enforcingmfa");
        for user in users {
            println!("{},{},{}", user.username, user.locked, user.enforcing);
        }
        return Ok(());
    }

    let username = require(args.username, "--username")?;
    if args.del {
        client.delete_user(&username).await?;
    } else if args.lock {
        client.lock_user(&username).await?;
    } else if args.unlock {
        client.unlock_user(&username).await?;
    } else if args.reset_mfa {
        client.reset_user_mfa(&username).await?;
    }
    println!("OK");
    Ok(())
}

async fn devices(client: &ControlClient, args: DevicesArgs) -> anyhow::Result<()> {
    if args.list {
        let devices = client.list_devices(args.username.as_deref()).await?;
        println!("address,username,publickey,endpoint,authorised");
        for device in devices {
            println!(
                "{},{},{},{},{}",
                device.address,
                device.username,
                device.public_key,
                device.endpoint.map(|e| e.to_string()).unwrap_or_default(),
                device.is_authorised(),
            );
        }
        return Ok(());
    }

    let address = require(args.address, "--address")?;
    if args.del {
        client.delete_device(&address).await?;
    } else if args.block {
        client.block_device(&address).await?;
    }
    println!("OK");
    Ok(())
}

async fn tokens(client: &ControlClient, args: TokensArgs) -> anyhow::Result<()> {
    if args.list {
        let tokens = client.list_tokens().await?;
        println!("token,username,overwrites,groups,uses");
        for token in tokens {
            println!(
                "{},{},{},{},{}",
                token.token,
                token.username,
                token.overwrites.unwrap_or_default(),
                token.groups.join(";"),
                token.num_uses,
            );
        }
        return Ok(());
    }

    if args.add {
        let username = require(args.username, "--username")?;
        let record = client
            .add_token(&TokenRequest {
                token: args.token,
                username,
                overwrites: args.overwrites,
                groups: args.groups,
                uses: args.uses,
            })
            .await?;
        println!("{}", record.token);
        return Ok(());
    }

    let token = require(args.token, "--token")?;
    client.delete_token(&token).await?;
    println!("OK");
    Ok(())
}

async fn firewall(client: &ControlClient, args: FirewallArgs) -> anyhow::Result<()> {
    if args.list {
        let rules = client.firewall_rules().await?;
        let rendered = serde_json::to_string_pretty(&rules).context("unable to render rules")?;
        println!("{rendered}");
    }
    Ok(())
}
