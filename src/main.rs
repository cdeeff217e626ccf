use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use unionfs::config::{BranchSpec, MountConfig};
use unionfs::fs::{UnionFsFuse, CTL_FILE};
use unionfs::{BranchInfo, UnionFs};

#[derive(Parser)]
#[command(name = "unionfs")]
#[command(about = "FUSE union filesystem over ordered branches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount a union and serve it until unmounted
    Mount {
        /// Branch as `path[=perm]`, top first; repeat for each branch
        #[arg(long = "branch", short = 'b')]
        branches: Vec<String>,

        /// JSON mount configuration; `--branch` entries are appended to it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Create policy (tdp, rr, mfs[:secs], mfsrr:<wmark>[:secs], ...)
        #[arg(long)]
        create: Option<String>,

        /// Copyup policy (tdp, bup, bu)
        #[arg(long)]
        copyup: Option<String>,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Mount point
        mountpoint: PathBuf,
    },

    /// Add a branch to a mounted union
    Add {
        mountpoint: PathBuf,

        /// Branch as `path[=perm]`; read-only by default
        branch: String,

        /// Position in the branch list, 0 is the top
        #[arg(long, short, default_value_t = 0)]
        index: usize,
    },

    /// Remove a branch from a mounted union
    Del { mountpoint: PathBuf, path: PathBuf },

    /// Change the permission of a branch
    Perm {
        mountpoint: PathBuf,
        path: PathBuf,
        perm: String,
    },

    /// List the branches of a mounted union
    List { mountpoint: PathBuf },
}

fn ctl_path(mountpoint: &Path) -> Result<PathBuf> {
    let mountpoint = mountpoint
        .canonicalize()
        .with_context(|| format!("{} is not accessible", mountpoint.display()))?;
    Ok(mountpoint.join(CTL_FILE))
}

fn send_ctl(mountpoint: &Path, cmd: &str) -> Result<()> {
    let path = ctl_path(mountpoint)?;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .with_context(|| {
            format!(
                "Failed to open control file (is {} mounted?)",
                mountpoint.display()
            )
        })?;
    file.write_all(cmd.as_bytes())
        .with_context(|| format!("control command '{}' failed", cmd))?;
    Ok(())
}

fn mount_config(
    config: Option<PathBuf>,
    branches: Vec<String>,
    create: Option<String>,
    copyup: Option<String>,
    allow_other: bool,
    mountpoint: PathBuf,
) -> Result<MountConfig> {
    let mut cfg = match config {
        Some(path) => MountConfig::from_file(&path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => MountConfig::new(&mountpoint, Vec::new()),
    };
    cfg.mount_point = mountpoint;
    let offset = cfg.branches.len();
    for (i, b) in branches.iter().enumerate() {
        cfg.branches.push(BranchSpec::parse_at(b, offset + i)?);
    }
    if let Some(create) = create {
        cfg.create = create.parse()?;
    }
    if let Some(copyup) = copyup {
        cfg.copyup = copyup.parse()?;
    }
    cfg.allow_other |= allow_other;
    cfg.validate()?;
    Ok(cfg)
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Mount {
            branches,
            config,
            create,
            copyup,
            allow_other,
            mountpoint,
        } => {
            std::fs::create_dir_all(&mountpoint)?;
            let mountpoint = mountpoint.canonicalize()?;
            let cfg = mount_config(config, branches, create, copyup, allow_other, mountpoint)?;

            let union = Arc::new(UnionFs::new(&cfg)?);
            let options = cfg.to_mount_options();
            log::info!("Mounting {:?} on {}", union, cfg.mount_point.display());
            fuser::mount2(UnionFsFuse::new(union), &cfg.mount_point, &options)
                .with_context(|| format!("mounting {}", cfg.mount_point.display()))?;
            println!("Unmounted {:?}", cfg.mount_point);
        }

        Commands::Add {
            mountpoint,
            branch,
            index,
        } => {
            let spec = BranchSpec::parse_at(&branch, 1)?;
            let path = spec.path.canonicalize()?;
            send_ctl(
                &mountpoint,
                &format!("add:{}:{}={}", index, path.display(), spec.perm),
            )?;
            println!("Added branch {} at index {}", path.display(), index);
        }

        Commands::Del { mountpoint, path } => {
            let path = path.canonicalize()?;
            send_ctl(&mountpoint, &format!("del:{}", path.display()))?;
            println!("Removed branch {}", path.display());
        }

        Commands::Perm {
            mountpoint,
            path,
            perm,
        } => {
            let path = path.canonicalize()?;
            let perm: unionfs::BranchPerm = perm.parse()?;
            send_ctl(&mountpoint, &format!("perm:{}={}", path.display(), perm))?;
            println!("Branch {} is now {}", path.display(), perm);
        }

        Commands::List { mountpoint } => {
            let mut data = String::new();
            std::fs::File::open(ctl_path(&mountpoint)?)
                .context("Failed to open control file")?
                .read_to_string(&mut data)?;
            let branches: Vec<BranchInfo> = serde_json::from_str(&data)?;

            println!("{:<6} {:<10} {:<8} PATH", "INDEX", "PERM", "WRITERS");
            println!("{:<6} {:<10} {:<8} ----", "-----", "----", "-------");
            for b in branches {
                println!(
                    "{:<6} {:<10} {:<8} {}",
                    b.index,
                    b.perm,
                    b.writers,
                    b.path.display()
                );
            }
        }
    }

    Ok(())
}
