use nockvault::store::{self, CoordinationStore};

fn main() -> anyhow::Result<()> {
    println!("🔍 Inspecting nockvault coordination store...");

    let path = std::env::args().nth(1).unwrap_or_else(|| "./data".to_string());
    let db = store::open(&nockvault::config::Storage { path: path.clone() })?;

    println!("\n📊 Records:");
    for (cf, count) in db.counts()? {
        println!("   {cf}: {count}");
    }

    let proposals = db.list_proposals(&Default::default())?;
    let stuck: Vec<_> = proposals
        .iter()
        .filter(|p| p.status == nockvault::ProposalStatus::Ready)
        .collect();
    if !stuck.is_empty() {
        println!("\n⏳ Ready but not broadcast:");
        for p in stuck {
            println!("   {} ({}/{} signatures)", p.id, p.signatures_collected(), p.threshold());
        }
    }

    // Show database storage info
    println!("\n🗄️ Database Storage Info:");
    if let Ok(entries) = std::fs::read_dir(&path) {
        let mut sst_files = 0;
        let mut total_size = 0u64;
        for entry in entries.flatten() {
            let p = entry.path();
            if p.extension().map_or(false, |ext| ext == "sst") {
                sst_files += 1;
            }
            if let Ok(metadata) = std::fs::metadata(&p) {
                total_size += metadata.len();
            }
        }
        println!("   SST files: {sst_files}");
        println!("   Total size: {total_size} bytes");
    }

    Ok(())
}
