//! Tool adapter table.
//!
//! A tool id maps to plain data: how to build its command line and where
//! its results end up. Nothing here holds state, so the step executor is
//! generic over every entry.

pub mod crtsh;

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::error::StepError;

/// One argv element of a command template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgTemplate {
    Literal(String),
    Target,
    WorkDir,
    /// Absolute path of the step's declared output file.
    Output,
    Wordlist,
    Resolvers,
}

impl ArgTemplate {
    pub fn lit(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutput {
    /// Results arrive on stdout; the executor tees them into `file`.
    Stdout { file: String },
    /// The tool writes `file` itself, usually via [`ArgTemplate::Output`].
    File { file: String },
    /// Whatever the tool leaves in the working directory.
    Discovered,
}

impl StepOutput {
    pub fn file_name(&self) -> Option<&str> {
        match self {
            Self::Stdout { file } | Self::File { file } => Some(file),
            Self::Discovered => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    Command {
        program: String,
        args: Vec<ArgTemplate>,
    },
    /// Certificate transparency lookup performed in-process.
    CertificateTransparency,
}

/// Which bruteforce toggle feeds a step's wordlist options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BruteforceFlavor {
    Static,
    Dynamic,
}

impl std::fmt::Display for BruteforceFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Static => "static",
            Self::Dynamic => "dynamic",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolSpec {
    pub id: String,
    pub description: String,
    pub kind: StepKind,
    pub output: StepOutput,
    pub bruteforce: Option<BruteforceFlavor>,
}

/// Per-job knobs for wordlist driven steps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wordlist: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolvers: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_args: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub target: &'a str,
    pub working_dir: &'a Path,
    pub options: Option<&'a StepOptions>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolSpec {
    /// Spec for an external command.
    pub fn command(
        id: &str,
        program: &str,
        args: Vec<ArgTemplate>,
        output: StepOutput,
    ) -> Self {
        Self {
            id: id.to_string(),
            description: String::new(),
            kind: StepKind::Command {
                program: program.to_string(),
                args,
            },
            output,
            bruteforce: None,
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn program(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Command { program, .. } => Some(program),
            StepKind::CertificateTransparency => None,
        }
    }

    pub fn output_path(&self, working_dir: &Path) -> Option<PathBuf> {
        self.output.file_name().map(|file| working_dir.join(file))
    }

    /// Expand the argument template. `None` for in-process steps.
    pub fn command_line(&self, ctx: &StepContext<'_>) -> Result<Option<CommandLine>, StepError> {
        let StepKind::Command { program, args } = &self.kind else {
            return Ok(None);
        };

        let mut argv = Vec::with_capacity(args.len());
        for arg in args {
            let value = match arg {
                ArgTemplate::Literal(value) => value.clone(),
                ArgTemplate::Target => ctx.target.to_string(),
                ArgTemplate::WorkDir => ctx.working_dir.display().to_string(),
                ArgTemplate::Output => self
                    .output_path(ctx.working_dir)
                    .ok_or_else(|| {
                        StepError::execution(format!(
                            "tool '{}' references an output file but declares none",
                            self.id
                        ))
                    })?
                    .display()
                    .to_string(),
                ArgTemplate::Wordlist => ctx
                    .options
                    .and_then(|opts| opts.wordlist.as_ref())
                    .ok_or_else(|| StepError::execution("no wordlist configured"))?
                    .display()
                    .to_string(),
                ArgTemplate::Resolvers => ctx
                    .options
                    .and_then(|opts| opts.resolvers.as_ref())
                    .ok_or_else(|| StepError::execution("no resolvers file configured"))?
                    .display()
                    .to_string(),
            };
            argv.push(value);
        }

        if let Some(options) = ctx.options {
            if let Some(threads) = options.threads {
                argv.push("-t".to_string());
                argv.push(threads.to_string());
            }
            argv.extend(options.extra_args.iter().cloned());
        }

        Ok(Some(CommandLine {
            program: program.clone(),
            args: argv,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolAvailability {
    pub id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub program: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_path: Option<PathBuf>,
    pub available: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: BTreeMap<String, ToolSpec>,
}

impl ToolCatalog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn builtin() -> Self {
        use ArgTemplate as A;

        let stdout = |id: &str| StepOutput::Stdout {
            file: format!("{id}.txt"),
        };

        let mut catalog = Self::empty();
        catalog.insert(ToolSpec {
            id: "crtsh".into(),
            description: "Certificate transparency search (crt.sh)".into(),
            kind: StepKind::CertificateTransparency,
            output: StepOutput::File {
                file: "crtsh.txt".into(),
            },
            bruteforce: None,
        });

        // Passive tools take the target as their final argument and print
        // results on stdout.
        let simple: [(&str, &[&str], &str); 15] = [
            ("waybackurls", &[], "Wayback Machine URLs"),
            ("gau", &[], "Known URLs from public archives"),
            ("waymore", &[], "Archived URL discovery"),
            ("subfinder", &["-silent"], "Passive subdomain enumeration"),
            ("chaos", &["-silent"], "ProjectDiscovery Chaos dataset"),
            ("github-subdomains", &[], "Subdomains mentioned in GitHub code"),
            ("gitlab-subdomains", &[], "Subdomains mentioned in GitLab code"),
            ("source_scan", &[], "Source code endpoint scan"),
            ("urlfinder", &[], "Passive URL discovery"),
            ("httpx", &["-silent"], "HTTP probing"),
            ("dnsx", &["-silent"], "DNS resolution"),
            ("puredns", &["resolve"], "Mass DNS resolution"),
            ("shuffledns", &["-silent"], "Wildcard-aware DNS resolution"),
            ("gotator", &[], "Subdomain permutations"),
            ("alterx", &[], "Pattern based permutations"),
        ];
        for (id, flags, description) in simple {
            let mut args: Vec<ArgTemplate> = flags.iter().map(|flag| A::lit(flag)).collect();
            args.push(A::Target);
            catalog.insert(ToolSpec::command(id, id, args, stdout(id)).describe(description));
        }

        catalog.insert(ToolSpec {
            bruteforce: Some(BruteforceFlavor::Static),
            ..ToolSpec::command(
                "static_bruteforce",
                "puredns",
                vec![A::lit("bruteforce"), A::Wordlist, A::Target, A::lit("-r"), A::Resolvers],
                stdout("static_bruteforce"),
            )
            .describe("Wordlist DNS bruteforce (puredns)")
        });
        catalog.insert(ToolSpec {
            bruteforce: Some(BruteforceFlavor::Dynamic),
            ..ToolSpec::command(
                "dynamic_bruteforce",
                "shuffledns",
                vec![
                    A::lit("-d"),
                    A::Target,
                    A::lit("-w"),
                    A::Wordlist,
                    A::lit("-r"),
                    A::Resolvers,
                ],
                stdout("dynamic_bruteforce"),
            )
            .describe("Generated-wordlist DNS bruteforce (shuffledns)")
        });

        catalog
    }

    pub fn with(mut self, spec: ToolSpec) -> Self {
        self.insert(spec);
        self
    }

    pub fn insert(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.id.clone(), spec);
    }

    /// Point a command tool at a different executable. Returns `false` when
    /// `id` is unknown or runs in-process.
    pub fn set_program(&mut self, id: &str, executable: impl Into<String>) -> bool {
        match self.tools.get_mut(id).map(|spec| &mut spec.kind) {
            Some(StepKind::Command { program, .. }) => {
                *program = executable.into();
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<&ToolSpec> {
        self.tools.get(id)
    }

    /// The step fed by the given bruteforce toggle.
    pub fn bruteforce_tool(&self, flavor: BruteforceFlavor) -> Option<&ToolSpec> {
        self.tools
            .values()
            .find(|spec| spec.bruteforce == Some(flavor))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tools.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn availability(&self) -> Vec<ToolAvailability> {
        self.tools
            .values()
            .map(|spec| {
                let program = spec.program().map(str::to_string);
                let resolved_path = program.as_deref().and_then(resolve_executable);
                let available = program.is_none() || resolved_path.is_some();
                ToolAvailability {
                    id: spec.id.clone(),
                    description: spec.description.clone(),
                    program,
                    resolved_path,
                    available,
                }
            })
            .collect()
    }
}

/// Resolve `program` the way `execvp` would: names are searched on `PATH`,
/// paths must point at an executable file.
pub fn resolve_executable(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx<'a>(dir: &'a Path, options: Option<&'a StepOptions>) -> StepContext<'a> {
        StepContext {
            target: "example.com",
            working_dir: dir,
            options,
        }
    }

    #[test]
    fn builtin_table_covers_known_tools() {
        let catalog = ToolCatalog::builtin();
        for id in [
            "crtsh",
            "subfinder",
            "chaos",
            "waybackurls",
            "gau",
            "waymore",
            "github-subdomains",
            "gitlab-subdomains",
            "source_scan",
            "urlfinder",
            "httpx",
            "dnsx",
            "gotator",
            "alterx",
            "puredns",
            "shuffledns",
            "static_bruteforce",
            "dynamic_bruteforce",
        ] {
            assert!(catalog.contains(id), "missing {id}");
        }
        assert!(!catalog.contains("unknown_tool"));
    }

    #[test]
    fn expands_target_and_output_placeholders() {
        let catalog = ToolCatalog::builtin();
        let dir = Path::new("/data/jobs/abc");

        let line = catalog
            .get("subfinder")
            .unwrap()
            .command_line(&ctx(dir, None))
            .unwrap()
            .unwrap();
        assert_eq!(line.program, "subfinder");
        assert_eq!(line.args, vec!["-silent", "example.com"]);

        let spec = ToolSpec::command(
            "writer",
            "writer",
            vec![ArgTemplate::lit("-o"), ArgTemplate::Output, ArgTemplate::Target],
            StepOutput::File {
                file: "writer.txt".into(),
            },
        );
        let line = spec.command_line(&ctx(dir, None)).unwrap().unwrap();
        assert_eq!(
            line.args,
            vec!["-o", "/data/jobs/abc/writer.txt", "example.com"]
        );
    }

    #[test]
    fn bruteforce_requires_wordlist_and_appends_extras() {
        let catalog = ToolCatalog::builtin();
        let spec = catalog.get("static_bruteforce").unwrap();
        let dir = Path::new("/tmp/job");

        assert!(matches!(
            spec.command_line(&ctx(dir, None)),
            Err(StepError::Execution { .. })
        ));

        let options = StepOptions {
            wordlist: Some("/w/best.txt".into()),
            resolvers: Some("/r/resolvers.txt".into()),
            threads: Some(50),
            extra_args: vec!["--wildcard-tests".into(), "5".into()],
        };
        let line = spec.command_line(&ctx(dir, Some(&options))).unwrap().unwrap();
        assert_eq!(line.program, "puredns");
        assert_eq!(
            line.args,
            vec![
                "bruteforce",
                "/w/best.txt",
                "example.com",
                "-r",
                "/r/resolvers.txt",
                "-t",
                "50",
                "--wildcard-tests",
                "5"
            ]
        );
    }

    #[test]
    fn program_overrides_only_apply_to_commands() {
        let mut catalog = ToolCatalog::builtin();
        assert!(catalog.set_program("subfinder", "/opt/bin/subfinder"));
        assert_eq!(catalog.get("subfinder").unwrap().program(), Some("/opt/bin/subfinder"));
        assert!(!catalog.set_program("crtsh", "/usr/bin/curl"));
        assert!(!catalog.set_program("nope", "/usr/bin/true"));
    }

    #[test]
    fn in_process_tools_are_always_available() {
        let catalog = ToolCatalog::empty()
            .with(ToolCatalog::builtin().get("crtsh").unwrap().clone())
            .with(ToolSpec::command(
                "ghost",
                "/definitely/not/installed",
                vec![],
                StepOutput::Discovered,
            ));
        let availability = catalog.availability();
        assert!(availability.iter().any(|t| t.id == "crtsh" && t.available));
        assert!(availability.iter().any(|t| t.id == "ghost" && !t.available));
    }

    #[cfg(unix)]
    #[test]
    fn executables_resolve_by_name_or_path() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("notes.txt");
        std::fs::write(&plain, "not a program").unwrap();

        assert!(resolve_executable("sh").is_some());
        assert!(resolve_executable("/bin/sh").is_some());
        assert_eq!(resolve_executable(plain.to_str().unwrap()), None);
        assert_eq!(resolve_executable("definitely-not-a-recon-tool"), None);
    }
}
