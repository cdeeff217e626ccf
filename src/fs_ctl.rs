use std::path::PathBuf;
use std::str::FromStr;

use fuser::ReplyWrite;

use crate::branch::{BIndex, BranchPerm};
use crate::config::BranchSpec;
use crate::error::{Result, UnionError};
use crate::fs::UnionFsFuse;
use crate::policy::{CopyupPolicy, CreatePolicy};

#[derive(Debug, Clone, PartialEq)]
pub enum CtlCommand {
    /// `add:<index>:<path>[=perm]`
    Add { index: BIndex, branch: BranchSpec },
    /// `del:<path>`
    Del { path: PathBuf },
    /// `perm:<path>=<perm>`
    Perm { path: PathBuf, perm: BranchPerm },
    /// `create:<policy>`
    Create(CreatePolicy),
    /// `copyup:<policy>`
    Copyup(CopyupPolicy),
}

impl FromStr for CtlCommand {
    type Err = UnionError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (verb, arg) = s
            .split_once(':')
            .ok_or_else(|| UnionError::Invalid(format!("control command '{}'", s)))?;
        let arg = arg.trim();
        match verb.trim().to_lowercase().as_str() {
            "add" => {
                let (index, branch) = arg
                    .split_once(':')
                    .ok_or_else(|| UnionError::Invalid(format!("add needs an index: '{}'", arg)))?;
                let index = index
                    .trim()
                    .parse()
                    .map_err(|_| UnionError::Invalid(format!("branch index '{}'", index)))?;
                // new branches default to read-only unless told otherwise
                let branch = BranchSpec::parse_at(branch.trim(), 1)?;
                Ok(CtlCommand::Add { index, branch })
            }
            "del" => Ok(CtlCommand::Del { path: arg.into() }),
            "perm" => {
                let (path, perm) = arg
                    .rsplit_once('=')
                    .ok_or_else(|| UnionError::Invalid(format!("perm needs '=': '{}'", arg)))?;
                Ok(CtlCommand::Perm {
                    path: path.into(),
                    perm: perm.parse()?,
                })
            }
            "create" => Ok(CtlCommand::Create(arg.parse()?)),
            "copyup" => Ok(CtlCommand::Copyup(arg.parse()?)),
            other => Err(UnionError::Invalid(format!("unknown control verb '{}'", other))),
        }
    }
}

impl UnionFsFuse {
    /// JSON listing of the branch table.
    pub(crate) fn ctl_contents(&self) -> Vec<u8> {
        let mut data = serde_json::to_vec_pretty(&self.fs.branches()).unwrap_or_default();
        data.push(b'\n');
        data
    }

    fn run_ctl(&self, cmd: CtlCommand) -> Result<()> {
        match cmd {
            CtlCommand::Add { index, branch } => {
                self.fs.add_branch(index, &branch.path, branch.perm)?;
            }
            CtlCommand::Del { path } => self.fs.del_branch(&path)?,
            CtlCommand::Perm { path, perm } => self.fs.set_branch_perm(&path, perm)?,
            CtlCommand::Create(policy) => self.fs.set_policies(Some(policy), None),
            CtlCommand::Copyup(policy) => self.fs.set_policies(None, Some(policy)),
        }
        // every cached name may now resolve differently
        self.inodes.forget_tree("/");
        Ok(())
    }

    pub(crate) fn handle_ctl_write(&mut self, data: &[u8], reply: ReplyWrite) {
        let text = String::from_utf8_lossy(data);
        log::info!("Control command: '{}'", text.trim());

        let res = text.parse::<CtlCommand>().and_then(|cmd| self.run_ctl(cmd));
        match res {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => {
                log::error!("Control command failed: {}", e);
                reply.error(e.errno());
            }
        }
    }
}
