use clap::{Parser, Subcommand};
use tokio::signal;
use uuid::Uuid;

use nockvault::{
    config, crypto, lock, metrics,
    note::format_nicks,
    proposal::ProposalStatus,
    store::{self, CoordinationStore, LockRecord, ProposalFilter},
    Pkh, SpendingCondition,
};

#[derive(Parser)]
#[command(author, version, about = "nockvault: m-of-n multisig coordination for Nockchain")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Derive the lock root for an ordered participant list
    Derive {
        #[arg(long)]
        threshold: u64,
        /// Participant PKH (hex), in order; repeat for each signer
        #[arg(long = "participant", required = true)]
        participants: Vec<String>,
    },
    /// Generate a throwaway Dilithium3 key and print its PKH
    Keygen,
    #[command(subcommand)]
    Lock(LockCmd),
    #[command(subcommand)]
    Proposal(ProposalCmd),
    /// Show broadcast transaction history
    History {
        #[arg(long)]
        participant: Option<String>,
    },
    /// Serve prometheus metrics until Ctrl-C
    Metrics,
}

#[derive(Subcommand)]
enum LockCmd {
    /// Register a wallet's spending condition
    Register {
        #[arg(long)]
        threshold: u64,
        #[arg(long = "participant", required = true)]
        participants: Vec<String>,
        /// PKH of the registering participant
        #[arg(long)]
        creator: String,
    },
    List {
        #[arg(long)]
        participant: Option<String>,
    },
}

#[derive(Subcommand)]
enum ProposalCmd {
    List {
        #[arg(long)]
        participant: Option<String>,
        #[arg(long)]
        lock: Option<String>,
        #[arg(long)]
        status: Option<String>,
    },
    Show {
        #[arg(long)]
        id: String,
    },
}

fn parse_pkhs(items: &[String]) -> anyhow::Result<Vec<Pkh>> {
    items
        .iter()
        .map(|s| s.parse::<Pkh>().map_err(|e| anyhow::anyhow!("bad participant '{}': {}", s, e)))
        .collect()
}

fn parse_pkh(item: &Option<String>) -> anyhow::Result<Option<Pkh>> {
    item.as_deref().map(|s| s.parse::<Pkh>()).transpose().map_err(|e| anyhow::anyhow!("{e}"))
}

fn print_lock(lock: &LockRecord) {
    println!(
        "🔐 {} ({}-of-{}) created {}",
        lock.lock_root,
        lock.threshold(),
        lock.condition.participants().len(),
        lock.created_at.format("%Y-%m-%d %H:%M:%S")
    );
    for p in lock.condition.participants() {
        println!("     👤 {}", p);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nockvault=info".into()),
        )
        .init();

    let cli = Cli::parse();

    // Read config from the CLI path, else fall back to the embedded default
    let cfg = match config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!("using embedded config: {e:#}");
            const EMBEDDED_CONFIG: &str = include_str!("../config.toml");
            config::load_from_str(EMBEDDED_CONFIG)?
        }
    };

    match cli.cmd {
        Cmd::Derive { threshold, participants } => {
            let pkhs = parse_pkhs(&participants)?;
            let root = lock::derive(threshold, &pkhs)?;
            println!("🔑 Lock root ({}-of-{}): {}", threshold, pkhs.len(), root);
        }
        Cmd::Keygen => {
            let (pk, _sk) = crypto::dilithium3_keypair();
            println!("🆔 PKH: {}", crypto::pkh_from_pk(&pk));
            println!("⚠️  Secret key was not saved; use a signing agent for real funds.");
        }
        Cmd::Lock(LockCmd::Register { threshold, participants, creator }) => {
            let pkhs = parse_pkhs(&participants)?;
            let creator: Pkh = creator.parse()?;
            let condition = SpendingCondition::new(threshold, pkhs)?;
            let record = LockRecord::new(condition, creator)?;
            let db = store::open(&cfg.storage)?;
            db.create_lock(record.clone())?;
            db.flush()?;
            println!("✅ Registered lock");
            print_lock(&record);
        }
        Cmd::Lock(LockCmd::List { participant }) => {
            let db = store::open(&cfg.storage)?;
            let locks = db.list_locks(parse_pkh(&participant)?.as_ref())?;
            if locks.is_empty() {
                println!("📭 No locks registered");
            }
            for l in &locks {
                print_lock(l);
            }
        }
        Cmd::Proposal(ProposalCmd::List { participant, lock, status }) => {
            let db = store::open(&cfg.storage)?;
            let filter = ProposalFilter {
                participant: parse_pkh(&participant)?,
                lock_root: lock.as_deref().map(str::parse).transpose()?,
                status: status.as_deref().map(str::parse::<ProposalStatus>).transpose()?,
            };
            let proposals = db.list_proposals(&filter)?;
            if proposals.is_empty() {
                println!("📭 No proposals");
            }
            for p in proposals {
                println!(
                    "📝 {} [{}] {}/{} signatures, input {}",
                    p.id,
                    p.status,
                    p.signatures_collected(),
                    p.threshold(),
                    format_nicks(p.total_input)
                );
            }
        }
        Cmd::Proposal(ProposalCmd::Show { id }) => {
            let id: Uuid = id.parse().map_err(|e| anyhow::anyhow!("bad proposal id: {e}"))?;
            let db = store::open(&cfg.storage)?;
            let Some(p) = db.get_proposal(&id)? else {
                return Err(anyhow::anyhow!("proposal {} not found", id));
            };
            println!("📝 Proposal {}", p.id);
            println!("   Status: {}", p.status);
            println!("   Lock: {}", p.lock_root);
            println!("   Proposer: {}", p.proposer);
            println!("   Tentative tx: {}", p.tx_id);
            if let Some(final_id) = p.final_tx_id {
                println!("   Final tx: {}", final_id);
            }
            println!("   Input: {}  Fee: {}", format_nicks(p.total_input), format_nicks(p.unsigned.fee()));
            for s in &p.seeds {
                println!("   ➡️  {} to {}", format_nicks(s.amount), s.recipient);
            }
            for s in &p.signatures {
                println!("   ✍️  {} at {}", s.signer, s.signed_at.format("%Y-%m-%d %H:%M:%S"));
            }
            if let Some(reason) = &p.failure {
                println!("   ❌ {}", reason);
            }
        }
        Cmd::History { participant } => {
            let db = store::open(&cfg.storage)?;
            let entries = db.list_history(parse_pkh(&participant)?.as_ref())?;
            if entries.is_empty() {
                println!("📭 No transactions");
            }
            for h in entries {
                println!(
                    "📜 {} {:?} {} signers, fee {}, at {}",
                    h.tx_id,
                    h.status,
                    h.signers.len(),
                    format_nicks(h.fee),
                    h.broadcast_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
        }
        Cmd::Metrics => {
            metrics::serve(cfg.metrics.clone())?;
            println!("📊 Metrics on http://{}/metrics (Ctrl-C to stop)", cfg.metrics.bind);
            signal::ctrl_c().await?;
            println!("👋 Shutting down");
        }
    }
    Ok(())
}
