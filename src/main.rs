//! Passkey wallet CLI
//!
//! A command-line interface for passkey-controlled multisig wallets.

use clap::{Args, Parser, Subcommand};
use passkey_multisig::api::{create_router, ApiState};
use passkey_multisig::cli;
use passkey_multisig::config::WalletConfig;
use passkey_multisig::guardian::GuardianManager;
use passkey_multisig::ledger::LedgerClient;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "passkey-wallet")]
#[command(author = "Darshan")]
#[command(version = "0.1.0")]
#[command(about = "Passkey-authorized multisig wallet client", long_about = None)]
struct Cli {
    /// Data directory for invitation storage
    #[arg(short, long, default_value = ".passkey_wallet")]
    data_dir: PathBuf,

    /// Cluster RPC endpoint
    #[arg(long, env = "PASSKEY_RPC_URL", default_value = passkey_multisig::config::DEFAULT_RPC_URL)]
    rpc_url: String,

    /// Multisig program id
    #[arg(long, env = "PASSKEY_PROGRAM_ID", default_value = passkey_multisig::multisig::DEFAULT_PROGRAM_ID)]
    program_id: String,

    /// Fee payer secret (comma-separated bytes or base58)
    #[arg(long, env = "PASSKEY_FEE_PAYER_SECRET", hide_env_values = true)]
    fee_payer_secret: Option<String>,

    /// RPC request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout: u64,

    /// Flip the public key parity byte in verification instructions
    #[arg(long)]
    flip_parity: bool,

    /// Guardian slots scanned when listing
    #[arg(long, default_value = "8")]
    max_guardians: u64,

    /// Admission lease in seconds; must exceed six request timeouts
    #[arg(long, default_value = "300")]
    admission_lease: u64,

    #[command(subcommand)]
    command: Commands,
}

impl Cli {
    fn config(&self) -> WalletConfig {
        WalletConfig {
            rpc_url: self.rpc_url.clone(),
            program_id: self.program_id.clone(),
            request_timeout_secs: self.timeout,
            data_dir: self.data_dir.clone(),
            max_guardians: self.max_guardians,
            admission_lease_secs: self.admission_lease,
            flip_public_key_parity: self.flip_parity,
            fee_payer_secret: self.fee_payer_secret.clone(),
            ..Default::default()
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Derive program addresses
    Derive {
        #[command(subcommand)]
        action: DeriveCommands,
    },

    /// Encode a secp256r1 verification payload as hex
    Encode {
        /// Signed message (hex)
        #[arg(short, long)]
        message: String,

        /// Public key, compressed or uncompressed (hex)
        #[arg(short, long)]
        public_key: String,

        /// Signature, DER or raw r||s (hex)
        #[arg(short, long)]
        signature: String,
    },

    /// Multisig wallet operations
    Wallet {
        #[command(subcommand)]
        action: WalletCommands,
    },

    /// Guardian invitations
    Invite {
        #[command(subcommand)]
        action: InviteCommands,
    },

    /// Guardian management
    Guardian {
        #[command(subcommand)]
        action: GuardianCommands,
    },

    /// Transfer proposals approved by several guardians
    Proposal {
        #[command(subcommand)]
        action: ProposalCommands,
    },

    /// Start the REST API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3000")]
        port: u16,
    },
}

#[derive(Subcommand)]
enum DeriveCommands {
    /// Multisig address for a passkey credential id
    Multisig {
        /// Credential id (base64)
        #[arg(short, long)]
        credential_id: String,
    },

    /// Guardian address
    Guardian {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,

        /// Guardian id
        #[arg(short, long)]
        id: u64,
    },
}

#[derive(Args)]
struct RecoveryArgs {
    /// Recovery hash (hex)
    #[arg(long)]
    recovery_hash: Option<String>,

    /// Recovery phrase, hashed locally
    #[arg(long)]
    recovery_phrase: Option<String>,
}

#[derive(Subcommand)]
enum WalletCommands {
    /// Create a multisig owned by a passkey
    Create {
        /// Owner credential id (base64)
        #[arg(short, long)]
        credential_id: String,

        /// Owner public key (hex)
        #[arg(short, long)]
        public_key: String,

        /// Owner display name
        #[arg(short, long, default_value = "Owner")]
        name: String,

        /// Approval threshold
        #[arg(short, long, default_value = "1")]
        threshold: u8,

        #[command(flatten)]
        recovery: RecoveryArgs,
    },

    /// Show a multisig account
    Show {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,
    },

    /// Bind a new passkey to a guardian using its recovery phrase
    Recover {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,

        /// Guardian whose passkey was lost
        #[arg(short, long, default_value = "1")]
        id: u64,

        /// New public key (hex)
        #[arg(short, long)]
        public_key: String,

        #[command(flatten)]
        recovery: RecoveryArgs,
    },
}

#[derive(Subcommand)]
enum ProposalCommands {
    /// Propose a transfer
    Create {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,

        /// Proposing guardian id
        #[arg(short, long, default_value = "1")]
        guardian: u64,

        /// Destination address
        #[arg(short, long)]
        to: String,

        /// Amount in lamports
        #[arg(short, long)]
        amount: u64,

        /// Description
        #[arg(short, long, default_value = "")]
        description: String,
    },

    /// Approve a proposal
    Approve {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,

        /// Proposal id
        #[arg(short, long)]
        id: u64,

        /// Approving guardian id
        #[arg(short, long)]
        guardian: u64,

        /// Guardian assertion JSON file
        #[arg(short, long)]
        assertion: PathBuf,
    },

    /// Execute an approved proposal
    Execute {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,

        /// Proposal id
        #[arg(short, long)]
        id: u64,
    },

    /// Show a proposal
    Show {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,

        /// Proposal id
        #[arg(short, long)]
        id: u64,
    },
}

#[derive(Subcommand)]
enum InviteCommands {
    /// Invite a new guardian
    Create {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,

        /// Guardian display name
        #[arg(short, long)]
        name: String,

        /// Acting owner guardian id
        #[arg(short, long, default_value = "1")]
        owner: u64,
    },

    /// Record the invitee's passkey registration
    Register {
        /// Invite code
        code: String,

        /// Invitee public key (hex)
        #[arg(short, long)]
        public_key: String,

        /// Invitee credential id (base64)
        #[arg(short, long)]
        credential_id: String,

        #[command(flatten)]
        recovery: RecoveryArgs,
    },

    /// Admit the invited guardian
    Confirm {
        /// Invite code
        code: String,

        /// Owner assertion JSON file
        #[arg(short, long)]
        assertion: PathBuf,
    },

    /// Show an invitation
    Show {
        /// Invite code
        code: String,
    },

    /// List invitations for a multisig
    List {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,
    },

    /// Delete stale open invitations
    Purge {
        /// Maximum age in minutes (default 30)
        #[arg(long)]
        max_age: Option<i64>,
    },
}

#[derive(Subcommand)]
enum GuardianCommands {
    /// List guardians on the ledger
    List {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,
    },

    /// Remove a guardian
    Remove {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,

        /// Guardian to remove
        #[arg(short, long)]
        id: u64,

        /// Acting owner guardian id
        #[arg(short, long, default_value = "1")]
        owner: u64,

        /// Owner assertion JSON file
        #[arg(short, long)]
        assertion: Option<PathBuf>,
    },

    /// Activate or deactivate a guardian
    Status {
        /// Multisig address
        #[arg(short, long)]
        multisig: String,

        /// Guardian to update
        #[arg(short, long)]
        id: u64,

        /// Acting owner guardian id
        #[arg(short, long, default_value = "1")]
        owner: u64,

        /// New state
        #[arg(long, action = clap::ArgAction::Set)]
        active: bool,

        /// Owner assertion JSON file
        #[arg(short, long)]
        assertion: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli.config();

    // Offline commands need neither ledger nor store
    match &cli.command {
        Commands::Derive { action } => {
            let deriver = config.deriver()?;
            return match action {
                DeriveCommands::Multisig { credential_id } => {
                    cli::cmd_derive_multisig(&deriver, credential_id)
                }
                DeriveCommands::Guardian { multisig, id } => {
                    cli::cmd_derive_guardian(&deriver, multisig, *id)
                }
            };
        }
        Commands::Encode {
            message,
            public_key,
            signature,
        } => {
            let payload = cli::cmd_encode(message, public_key, signature, config.flip_public_key_parity)?;
            println!("{}", payload);
            return Ok(());
        }
        _ => {}
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let ledger: Arc<dyn LedgerClient> = Arc::new(config.rpc_ledger());
        let manager = config.guardian_manager(ledger)?;
        run_command(cli.command, manager).await
    })
}

async fn run_command(
    command: Commands,
    manager: GuardianManager,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Derive { .. } | Commands::Encode { .. } => unreachable!(),

        Commands::Wallet { action } => match action {
            WalletCommands::Create {
                credential_id,
                public_key,
                name,
                threshold,
                recovery,
            } => {
                let hash = cli::recovery_hash(
                    recovery.recovery_hash.as_deref(),
                    recovery.recovery_phrase.as_deref(),
                )?;
                cli::cmd_wallet_create(&manager, &credential_id, threshold, &name, hash, &public_key)
                    .await?;
            }
            WalletCommands::Show { multisig } => {
                cli::cmd_wallet_show(&manager, &multisig).await?;
            }
            WalletCommands::Recover {
                multisig,
                id,
                public_key,
                recovery,
            } => {
                let hash = cli::recovery_hash(
                    recovery.recovery_hash.as_deref(),
                    recovery.recovery_phrase.as_deref(),
                )?;
                cli::cmd_wallet_recover(&manager, &multisig, id, hash, &public_key).await?;
            }
        },

        Commands::Proposal { action } => match action {
            ProposalCommands::Create {
                multisig,
                guardian,
                to,
                amount,
                description,
            } => {
                cli::cmd_proposal_create(&manager, &multisig, guardian, &to, amount, &description)
                    .await?;
            }
            ProposalCommands::Approve {
                multisig,
                id,
                guardian,
                assertion,
            } => {
                cli::cmd_proposal_approve(&manager, &multisig, id, guardian, &assertion).await?;
            }
            ProposalCommands::Execute { multisig, id } => {
                cli::cmd_proposal_execute(&manager, &multisig, id).await?;
            }
            ProposalCommands::Show { multisig, id } => {
                cli::cmd_proposal_show(&manager, &multisig, id).await?;
            }
        },

        Commands::Invite { action } => match action {
            InviteCommands::Create {
                multisig,
                name,
                owner,
            } => {
                cli::cmd_invite_create(&manager, &multisig, &name, owner).await?;
            }
            InviteCommands::Register {
                code,
                public_key,
                credential_id,
                recovery,
            } => {
                let hash = cli::recovery_hash(
                    recovery.recovery_hash.as_deref(),
                    recovery.recovery_phrase.as_deref(),
                )?;
                cli::cmd_invite_register(&manager, &code, hash, &public_key, &credential_id)
                    .await?;
            }
            InviteCommands::Confirm { code, assertion } => {
                cli::cmd_invite_confirm(&manager, &code, &assertion).await?;
            }
            InviteCommands::Show { code } => {
                cli::cmd_invite_show(&manager, &code).await?;
            }
            InviteCommands::List { multisig } => {
                cli::cmd_invite_list(&manager, &multisig).await?;
            }
            InviteCommands::Purge { max_age } => {
                cli::cmd_invite_purge(&manager, max_age).await?;
            }
        },

        Commands::Guardian { action } => match action {
            GuardianCommands::List { multisig } => {
                cli::cmd_guardian_list(&manager, &multisig).await?;
            }
            GuardianCommands::Remove {
                multisig,
                id,
                owner,
                assertion,
            } => {
                cli::cmd_guardian_remove(&manager, &multisig, id, owner, assertion.as_deref())
                    .await?;
            }
            GuardianCommands::Status {
                multisig,
                id,
                owner,
                active,
                assertion,
            } => {
                cli::cmd_guardian_status(
                    &manager,
                    &multisig,
                    id,
                    owner,
                    active,
                    assertion.as_deref(),
                )
                .await?;
            }
        },

        Commands::Serve { port } => {
            println!("🚀 Starting passkey wallet API on port {}", port);
            println!("   Program: {}", manager.wallet().builder().deriver().program_id());
            println!("   Fee payer: {}", manager.wallet().fee_payer());

            let app = create_router(ApiState::new(manager));
            let addr = format!("0.0.0.0:{}", port);
            println!("   API: http://localhost:{}/api", port);

            let listener = tokio::net::TcpListener::bind(&addr).await?;
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = tokio::signal::ctrl_c().await;
                    println!("\n📴 Shutting down API server...");
                })
                .await?;
        }
    }

    Ok(())
}
