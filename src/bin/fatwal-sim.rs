//! fatwal Simulator
//!
//! Runs a scripted chain update on a RAM volume, optionally cutting power
//! part way through, then reboots the volume and checks that recovery left
//! it consistent. Also decodes the log of a saved volume image.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum};
use fatwal::log::{FatChain, LogHeader, CHAIN_OFFSET, CHAIN_SIZE, HEADER_SIZE};
use fatwal::{Config, FatType, LogEntry, LogFileState, Media, RamVolume, Result, TransactionLog, Volume};
use tracing_subscriber::{fmt, EnvFilter};

/// fatwal simulator
#[derive(Parser, Debug)]
#[command(name = "fatwal-sim")]
#[command(about = "Power-loss simulator for the FAT fault tolerant log")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Update a file's cluster chain, optionally losing power, then recover
    Simulate {
        /// FAT variant of the volume
        #[arg(long, value_enum, default_value = "fat16")]
        fat_type: FatTypeArg,

        /// Clusters in the data area
        #[arg(long, default_value = "256")]
        clusters: u32,

        /// Bytes per sector
        #[arg(long, default_value = "512")]
        sector_size: u32,

        /// Clusters in the file before the update
        #[arg(long, default_value = "16")]
        chain_len: u32,

        /// Chain update to run
        #[arg(long, value_enum, default_value = "truncate")]
        scenario: Scenario,

        /// Clusters kept by truncate, or added by extend
        #[arg(long, default_value = "4")]
        amount: u32,

        /// Lose power after this many durable sector writes
        #[arg(long)]
        crash_after: Option<u64>,

        /// Cleanup cache size in bytes (4 bytes per cluster)
        #[arg(long, default_value = "1024")]
        cache_bytes: usize,

        /// Save the volume image here when done
        #[arg(long)]
        image: Option<PathBuf>,
    },

    /// Decode the log file of a saved volume image
    Inspect {
        /// Image written by `simulate --image`
        #[arg(long)]
        image: PathBuf,

        /// Boot sector offset of the log start cluster
        #[arg(long, default_value = "116")]
        boot_index: usize,

        /// Log file capacity in bytes
        #[arg(long, default_value = "3072")]
        log_capacity: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum FatTypeArg {
    Fat12,
    Fat16,
    Fat32,
    Exfat,
}

impl From<FatTypeArg> for FatType {
    fn from(arg: FatTypeArg) -> Self {
        match arg {
            FatTypeArg::Fat12 => FatType::Fat12,
            FatTypeArg::Fat16 => FatType::Fat16,
            FatTypeArg::Fat32 => FatType::Fat32,
            FatTypeArg::Exfat => FatType::ExFat,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Scenario {
    /// Release every cluster after the first `amount`
    Truncate,
    /// Append `amount` newly allocated clusters
    Extend,
}

fn main() -> ExitCode {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fatwal=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let args = Args::parse();
    tracing::info!("fatwal-sim v{}", fatwal::VERSION);

    let outcome = match args.command {
        Commands::Simulate {
            fat_type,
            clusters,
            sector_size,
            chain_len,
            scenario,
            amount,
            crash_after,
            cache_bytes,
            image,
        } => {
            let plan = Plan {
                fat_type: fat_type.into(),
                clusters,
                sector_size,
                chain_len,
                scenario,
                amount,
                crash_after,
                config: Config::builder().cleanup_cache_size(cache_bytes).build(),
                image,
            };
            simulate(&plan)
        }
        Commands::Inspect {
            image,
            boot_index,
            log_capacity,
        } => {
            let config = Config::builder()
                .boot_index(boot_index)
                .log_capacity(log_capacity)
                .build();
            inspect(&image, &config).map(|()| true)
        }
    };

    match outcome {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

// =============================================================================
// Simulation
// =============================================================================

struct Plan {
    fat_type: FatType,
    clusters: u32,
    sector_size: u32,
    chain_len: u32,
    scenario: Scenario,
    amount: u32,
    crash_after: Option<u64>,
    config: Config,
    image: Option<PathBuf>,
}

/// Where the simulated file's directory record lives
struct FileRecord {
    dir_cluster: u32,
    dir_sector: u64,
}

/// Returns whether the volume was consistent after recovery
fn simulate(plan: &Plan) -> Result<bool> {
    if plan.chain_len < 2 || plan.amount == 0 {
        return Err(fatwal::FatWalError::Config(
            "need a chain of at least 2 clusters and a non-zero amount".to_string(),
        ));
    }
    if plan.scenario == Scenario::Truncate && plan.amount >= plan.chain_len {
        return Err(fatwal::FatWalError::Config(
            "truncate must keep fewer clusters than the chain has".to_string(),
        ));
    }

    let volume = RamVolume::new(plan.fat_type, plan.sector_size, 1, plan.clusters)?;
    let mut media = Media::new(volume);
    media.enable(plan.config.clone())?;

    // Directory cluster, then the file
    let dir_cluster = free_clusters(&mut media, 1, &[])?[0];
    media.volume_mut().link_chain(&[dir_cluster])?;
    let record = FileRecord {
        dir_cluster,
        dir_sector: media.volume().geometry().cluster_to_sector(dir_cluster),
    };

    let file = free_clusters(&mut media, plan.chain_len, &[])?;
    media.volume_mut().link_chain(&file)?;
    media.write_directory(record.dir_sector, 0, &dir_record(file[0], plan.chain_len))?;
    media.flush()?;

    tracing::info!(
        scenario = ?plan.scenario,
        first = file[0],
        len = plan.chain_len,
        "File created"
    );

    if let Some(writes) = plan.crash_after {
        media.volume_mut().crash_after_writes(writes);
    }

    let result = match plan.scenario {
        Scenario::Truncate => media.transaction(|m| truncate(m, &record, &file, plan.amount)),
        Scenario::Extend => media.transaction(|m| extend(m, &record, &file, plan.amount)),
    };

    match &result {
        Ok(()) => tracing::info!("Transaction committed"),
        Err(e) => tracing::warn!(error = %e, "Transaction did not complete"),
    }

    let mut volume = media.into_volume();
    if volume.is_crashed() || result.is_err() {
        tracing::info!(durable_writes = volume.durable_writes(), "Power cycling volume");
        volume.power_cycle();
    }

    let mut media = Media::new(volume);
    media.enable(plan.config.clone())?;

    let consistent = check(&mut media, &record, file[0])?;

    if let Some(path) = &plan.image {
        media.volume().save(path)?;
        tracing::info!("Image saved to {}", path.display());
    }

    Ok(consistent)
}

fn truncate(media: &mut Media<RamVolume>, record: &FileRecord, file: &[u32], keep: u32) -> Result<()> {
    let last = media.volume().geometry().fat_type.last();
    let front = file[keep as usize - 1];
    let original = file[keep as usize];

    media.set_fat_chain(false, front, last, original, last)?;
    media.write_fat_entry(front, last)?;
    media.end_undo_phase()?;
    media.write_directory(record.dir_sector, 0, &dir_record(file[0], keep))
}

fn extend(media: &mut Media<RamVolume>, record: &FileRecord, file: &[u32], grow: u32) -> Result<()> {
    let geometry = media.volume().geometry().clone();
    let last = geometry.fat_type.last();
    let tail = file[file.len() - 1];

    let new = free_clusters(media, grow, file)?;
    media.set_fat_chain(false, tail, new[0], last, last)?;

    for (i, &cluster) in new.iter().enumerate() {
        let next = new.get(i + 1).copied().unwrap_or(last);
        media.write_fat_entry(cluster, next)?;
        if geometry.fat_type.is_exfat() {
            media.cluster_state_set(cluster, true)?;
        }
    }
    media.write_fat_entry(tail, new[0])?;
    media.end_undo_phase()?;

    media.write_directory(record.dir_sector, 0, &dir_record(file[0], file.len() as u32 + grow))
}

/// Find `count` free clusters, lowest first, through the redirect layer
fn free_clusters(media: &mut Media<RamVolume>, count: u32, exclude: &[u32]) -> Result<Vec<u32>> {
    let geometry = media.volume().geometry().clone();
    let mut found = Vec::new();

    for cluster in fatwal::volume::FAT_ENTRY_START..geometry.cluster_limit() {
        if found.len() == count as usize {
            break;
        }
        if exclude.contains(&cluster) || media.read_fat_entry(cluster)? != fatwal::volume::FREE_CLUSTER {
            continue;
        }
        if geometry.fat_type.is_exfat() && media.cluster_state_get(cluster)? {
            continue;
        }
        found.push(cluster);
    }

    if found.len() < count as usize {
        return Err(fatwal::FatWalError::Config(format!(
            "volume has fewer than {} free clusters",
            count
        )));
    }
    Ok(found)
}

/// Directory record: first cluster (4) | cluster count (4)
fn dir_record(first: u32, clusters: u32) -> [u8; 8] {
    let mut record = [0u8; 8];
    record[..4].copy_from_slice(&first.to_le_bytes());
    record[4..].copy_from_slice(&clusters.to_le_bytes());
    record
}

/// Compare the directory record, the FAT chain and the allocation state
fn check(media: &mut Media<RamVolume>, record: &FileRecord, first: u32) -> Result<bool> {
    let geometry = media.volume().geometry().clone();

    let mut sector = vec![0u8; geometry.bytes_per_sector as usize];
    media.read_sectors(record.dir_sector, &mut sector)?;
    let recorded_first = u32::from_le_bytes([sector[0], sector[1], sector[2], sector[3]]);
    let recorded_len = u32::from_le_bytes([sector[4], sector[5], sector[6], sector[7]]);

    let mut chain = Vec::new();
    let mut current = recorded_first;
    while geometry.is_chain_cluster(current) && chain.len() <= geometry.total_clusters as usize {
        chain.push(current);
        current = media.read_fat_entry(current)?;
    }

    let mut expected: BTreeSet<u32> = chain.iter().copied().collect();
    expected.insert(record.dir_cluster);
    if let Some(log) = media.log() {
        expected.extend(log.log_clusters());
    }

    let allocated: BTreeSet<u32> = media.volume_mut().allocated_clusters()?.into_iter().collect();
    let leaked: Vec<u32> = allocated.difference(&expected).copied().collect();
    let missing: Vec<u32> = expected.difference(&allocated).copied().collect();

    let mut consistent = recorded_first == first
        && recorded_len as usize == chain.len()
        && current == geometry.fat_type.last()
        && leaked.is_empty()
        && missing.is_empty();

    if geometry.fat_type.is_exfat() {
        let used: BTreeSet<u32> = media.volume_mut().bitmap_used_clusters()?.into_iter().collect();
        if used != expected {
            tracing::error!(?used, ?expected, "Allocation bitmap disagrees with the FAT");
            consistent = false;
        }
    }

    tracing::info!(
        recorded_len,
        chain_len = chain.len(),
        ?leaked,
        ?missing,
        consistent,
        "Volume checked"
    );
    println!(
        "file: {} clusters recorded, {} linked; leaked {:?}; missing {:?}; {}",
        recorded_len,
        chain.len(),
        leaked,
        missing,
        if consistent { "CONSISTENT" } else { "INCONSISTENT" }
    );

    Ok(consistent)
}

// =============================================================================
// Inspection
// =============================================================================

fn inspect(path: &Path, config: &Config) -> Result<()> {
    let mut volume = RamVolume::load(path)?;
    let geometry = volume.geometry().clone();
    println!(
        "volume: {:?}, {} byte sectors, {} clusters",
        geometry.fat_type, geometry.bytes_per_sector, geometry.total_clusters
    );

    let image = match TransactionLog::read_image(&mut volume, config)? {
        Some(image) => image,
        None => {
            println!("no log file recorded in the boot sector");
            return Ok(());
        }
    };

    let header = LogHeader::decode(&image[..HEADER_SIZE])?;
    let chain = FatChain::decode(&image[CHAIN_OFFSET..CHAIN_OFFSET + CHAIN_SIZE])?;
    println!(
        "header: id {:#010x}, size {}, version {}.{}, valid {}",
        header.id,
        header.total_size,
        header.version_major,
        header.version_minor,
        header.is_valid()?
    );
    println!(
        "chain: flags {:#04x}, front {}, new {}, original {}, back {}, next deletion {}",
        chain.flags,
        chain.insertion_front,
        chain.head_new,
        chain.head_original,
        chain.insertion_back,
        chain.next_deletion
    );

    match LogFileState::parse(&image, config.log_capacity) {
        LogFileState::Absent => println!("state: no log"),
        LogFileState::Uncommitted(_) => println!("state: uncommitted (splice would be undone)"),
        LogFileState::Committed(buffer) => {
            println!("state: committed, {} entries (would be replayed)", buffer.entry_count());
            for item in buffer.entries() {
                let (position, entry) = item?;
                match entry {
                    LogEntry::Fat { cluster, value } => {
                        println!("  @{:<5} FAT     cluster {} = {:#x}", position, cluster, value)
                    }
                    LogEntry::Bitmap { cluster, value } => {
                        println!("  @{:<5} BITMAP  cluster {} = {}", position, cluster, value)
                    }
                    LogEntry::Directory { sector, offset, data } => println!(
                        "  @{:<5} DIR     sector {} offset {} ({} bytes)",
                        position,
                        sector,
                        offset,
                        data.len()
                    ),
                    LogEntry::Unknown { kind, size } => {
                        println!("  @{:<5} UNKNOWN type {} ({} bytes)", position, kind, size)
                    }
                }
            }
        }
    }

    Ok(())
}
