use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::executor::{CommandSpec, Redirect};
use crate::idle::IdleSettings;
use crate::pipeline::Pipeline;

// Intermediate artifacts inside each instance directory. Phases find each
// other's output only through these names.
pub const PARSED_FILE: &str = "temp.parsed";
pub const GROUND_FILE: &str = "temp.ground";
pub const SAS_FILE: &str = "problem.sas";
pub const VERIFY_LOG: &str = "verify.log";
pub const PANDA_LOG: &str = "panda.log";
pub const PLAN_FILE: &str = "plan_file";

pub const PARSER_BIN: &str = "pandaPIparser";
pub const GROUNDER_BIN: &str = "pandaPIgrounder";
pub const ENGINE_BIN: &str = "pandaPIengine";
pub const TOAD_BIN: &str = "toad";
pub const DOWNWARD_BIN: &str = "downward";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Planner {
    #[default]
    Toad,
    PandaPi,
}

impl Planner {
    pub fn as_str(&self) -> &'static str {
        match self {
            Planner::Toad => "toad",
            Planner::PandaPi => "panda-pi",
        }
    }

    /// Idle thresholds (cpu %, memory %) each pipeline was tuned with.
    pub fn default_idle_settings(&self) -> IdleSettings {
        let (cpu_threshold, memory_threshold) = match self {
            Planner::Toad => (1.0, 5.0),
            Planner::PandaPi => (5.0, 20.0),
        };
        IdleSettings {
            cpu_threshold,
            memory_threshold,
            ..IdleSettings::default()
        }
    }

    pub fn phase_labels(&self) -> &'static [&'static str] {
        match self {
            Planner::Toad => &[
                "Parsing",
                "Grounding",
                "Preprocessing",
                "Solving",
                "Plan_Verification",
            ],
            Planner::PandaPi => &[
                "run_pandaPIparser",
                "run_pandaPIgrounder",
                "run_pandaPIengine",
                "run_pandaPIparser_convert",
            ],
        }
    }

    pub fn build_pipeline(&self, instance: &InstanceFiles) -> Result<Pipeline> {
        let tool = |name: &str| instance.tool_dir.join(name).to_string_lossy().to_string();
        let in_workdir = |cmd: CommandSpec| cmd.current_dir(&instance.work_dir);
        let parse = in_workdir(CommandSpec::new(tool(PARSER_BIN)).args([
            path_arg(&instance.domain_file),
            path_arg(&instance.problem_file),
            PARSED_FILE.to_string(),
        ]));
        let labels = self.phase_labels();

        match self {
            Planner::Toad => Pipeline::new(vec![
                (labels[0], parse),
                (
                    labels[1],
                    in_workdir(
                        CommandSpec::new(tool(GROUNDER_BIN))
                            .args(["-q", "-i", PARSED_FILE, GROUND_FILE]),
                    ),
                ),
                (
                    labels[2],
                    in_workdir(
                        CommandSpec::new(tool(TOAD_BIN))
                            .args(["BU-IO", GROUND_FILE, "ht", "ipt=15"]),
                    ),
                ),
                (
                    labels[3],
                    in_workdir(
                        CommandSpec::new(tool(DOWNWARD_BIN))
                            .args([
                                "--evaluator",
                                "hff=ff()",
                                "--search",
                                "lazy_greedy([dfad(), hff], preferred=[hff], boost=1000)",
                            ])
                            .stdin_from(SAS_FILE),
                    ),
                ),
                (
                    labels[4],
                    in_workdir(
                        CommandSpec::new(tool(PARSER_BIN)).args(["-c", VERIFY_LOG, PLAN_FILE]),
                    ),
                ),
            ]),
            Planner::PandaPi => {
                let psas = instance.psas_file_name();
                Pipeline::new(vec![
                    (labels[0], parse),
                    (
                        labels[1],
                        in_workdir(
                            CommandSpec::new(tool(GROUNDER_BIN))
                                .args(["-q", "-i", PARSED_FILE, psas.as_str()]),
                        ),
                    ),
                    (
                        labels[2],
                        in_workdir(
                            CommandSpec::new(tool(ENGINE_BIN))
                                .args(["-g", "none", "--heuristic=rc2(add)", psas.as_str()])
                                .stdout_to(Redirect::Append(PathBuf::from(PANDA_LOG))),
                        ),
                    ),
                    (
                        labels[3],
                        in_workdir(
                            CommandSpec::new(tool(PARSER_BIN)).args(["-c", PANDA_LOG, PLAN_FILE]),
                        ),
                    ),
                ])
            }
        }
    }
}

impl fmt::Display for Planner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Absolute locations one instance's phases are built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceFiles {
    pub tool_dir: PathBuf,
    pub domain_file: PathBuf,
    pub problem_file: PathBuf,
    pub work_dir: PathBuf,
}

impl InstanceFiles {
    pub fn instance_name(&self) -> String {
        file_stem(&self.problem_file)
    }

    /// `<domain-stem>-<instance>.psas`, the grounded task name the PANDA engine expects.
    pub fn psas_file_name(&self) -> String {
        format!(
            "{}-{}.psas",
            file_stem(&self.domain_file),
            self.instance_name()
        )
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files() -> InstanceFiles {
        InstanceFiles {
            tool_dir: PathBuf::from("/opt/planners"),
            domain_file: PathBuf::from("/data/rover/domain.hddl"),
            problem_file: PathBuf::from("/data/rover/pfile01.hddl"),
            work_dir: PathBuf::from("/runs/rover/pfile01"),
        }
    }

    #[test]
    fn toad_pipeline_chains_fixed_artifacts() {
        let pipeline = Planner::Toad.build_pipeline(&files()).expect("pipeline");
        assert_eq!(pipeline.labels(), Planner::Toad.phase_labels().to_vec());
        let phases = pipeline.phases();
        assert_eq!(phases[0].command.program, "/opt/planners/pandaPIparser");
        assert_eq!(
            phases[0].command.args,
            vec!["/data/rover/domain.hddl", "/data/rover/pfile01.hddl", "temp.parsed"]
        );
        assert_eq!(phases[1].command.args, vec!["-q", "-i", "temp.parsed", "temp.ground"]);
        assert_eq!(phases[2].command.args[1], "temp.ground");
        assert_eq!(phases[3].command.stdin, Some(PathBuf::from("problem.sas")));
        assert_eq!(phases[4].command.args, vec!["-c", "verify.log", "plan_file"]);
        assert!(phases
            .iter()
            .all(|p| p.command.current_dir == Some(PathBuf::from("/runs/rover/pfile01"))));
    }

    #[test]
    fn panda_pipeline_appends_engine_output_to_log() {
        let pipeline = Planner::PandaPi.build_pipeline(&files()).expect("pipeline");
        assert_eq!(pipeline.len(), 4);
        let phases = pipeline.phases();
        assert_eq!(phases[1].command.args[3], "domain-pfile01.psas");
        assert_eq!(
            phases[2].command.stdout,
            Some(Redirect::Append(PathBuf::from("panda.log")))
        );
        assert_eq!(phases[3].command.args, vec!["-c", "panda.log", "plan_file"]);
    }

    #[test]
    fn panda_labels_match_existing_panda_tables() {
        assert_eq!(
            Planner::PandaPi.phase_labels(),
            &[
                "run_pandaPIparser",
                "run_pandaPIgrounder",
                "run_pandaPIengine",
                "run_pandaPIparser_convert",
            ]
        );
        let pipeline = Planner::PandaPi.build_pipeline(&files()).expect("pipeline");
        assert_eq!(pipeline.labels(), Planner::PandaPi.phase_labels().to_vec());
    }

    #[test]
    fn planner_names_round_trip_through_yaml() {
        let planner: Planner = serde_yaml::from_str("panda-pi").expect("parse");
        assert_eq!(planner, Planner::PandaPi);
        assert_eq!(planner.to_string(), "panda-pi");
    }

    #[test]
    fn default_thresholds_differ_per_planner() {
        assert_eq!(Planner::Toad.default_idle_settings().cpu_threshold, 1.0);
        assert_eq!(Planner::PandaPi.default_idle_settings().memory_threshold, 20.0);
    }
}
