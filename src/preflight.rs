// ABOUTME: Pre-flight validation checks for survey sync prerequisites
// ABOUTME: Validates connectivity, ActionKit read access, survey schema access, and the registry

use anyhow::Result;
use tokio_postgres::Client;

use crate::config::SyncConfig;
use crate::postgres::{check_schema_create_privilege, check_table_select_permissions};
use crate::survey::backend::PageRegistry;
use crate::survey::registry::REGISTRY_TABLE;

/// ActionKit tables the sync reads
pub const SOURCE_TABLES: &[&str] = &["core_page", "core_action", "core_actionfield"];

/// Individual check result
#[derive(Debug, Clone)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// Issue with suggested fixes
#[derive(Debug, Clone)]
pub struct PreflightIssue {
    pub title: String,
    pub explanation: String,
    pub fixes: Vec<String>,
}

/// Complete pre-flight results
#[derive(Debug, Default)]
pub struct PreflightResult {
    pub network: Vec<CheckResult>,
    pub source_permissions: Vec<CheckResult>,
    pub survey_permissions: Vec<CheckResult>,
    pub issues: Vec<PreflightIssue>,
}

impl PreflightResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all_passed(&self) -> bool {
        self.issues.is_empty()
    }

    pub fn failed_count(&self) -> usize {
        self.issues.len()
    }

    /// Print formatted output
    pub fn print(&self) {
        println!();
        println!("Pre-flight Checks");
        println!("{}", "═".repeat(61));
        println!();

        print_section("Network Connectivity:", &self.network);
        print_section("ActionKit Permissions:", &self.source_permissions);
        print_section("Survey Schema:", &self.survey_permissions);

        println!("{}", "═".repeat(61));
        if self.all_passed() {
            println!("PASSED: All pre-flight checks successful");
        } else {
            println!("FAILED: {} issue(s) must be resolved", self.failed_count());
            println!();
            for (i, issue) in self.issues.iter().enumerate() {
                println!("Issue {}: {}", i + 1, issue.title);
                println!("  {}", issue.explanation);
                println!();
                println!("  Fix options:");
                for fix in &issue.fixes {
                    println!("    • {}", fix);
                }
                println!();
            }
        }
    }
}

fn print_section(title: &str, checks: &[CheckResult]) {
    if checks.is_empty() {
        return;
    }
    println!("{}", title);
    for check in checks {
        let icon = if check.passed { "✓" } else { "✗" };
        println!("  {} {}", icon, check.message);
        if let Some(ref details) = check.details {
            println!("      {}", details);
        }
    }
    println!();
}

/// Run all pre-flight checks against the configured database.
pub async fn run_preflight_checks(config: &SyncConfig) -> Result<PreflightResult> {
    let mut result = PreflightResult::new();

    let client = match crate::postgres::connect_with_retry(&config.database_url).await {
        Ok(client) => {
            result
                .network
                .push(CheckResult::pass("database", "Database reachable"));
            client
        }
        Err(e) => {
            result.network.push(CheckResult::fail(
                "database",
                format!("Cannot connect to database: {}", e),
            ));
            result.issues.push(PreflightIssue {
                title: "Database unreachable".to_string(),
                explanation: format!("{:#}", e),
                fixes: vec![
                    "Verify DATABASE_URL is correct".to_string(),
                    "Check network connectivity to database host".to_string(),
                    "Use --allow-self-signed-certs for servers with self-signed TLS certificates"
                        .to_string(),
                ],
            });
            return Ok(result);
        }
    };

    check_source_permissions(&mut result, &client, &config.ak_schema).await;
    check_survey_schema(&mut result, &client, &config.survey_schema).await;

    let backend = crate::survey::pg::PgSurveyBackend::new(client, config);
    check_registry(&mut result, &backend, &config.survey_schema).await;

    Ok(result)
}

async fn check_source_permissions(result: &mut PreflightResult, client: &Client, schema: &str) {
    match check_table_select_permissions(client, schema, SOURCE_TABLES).await {
        Ok(perms) => {
            for table in &perms.accessible_tables {
                result.source_permissions.push(CheckResult::pass(
                    table.clone(),
                    format!("SELECT on {}", table),
                ));
            }
            for table in &perms.inaccessible_tables {
                result.source_permissions.push(CheckResult::fail(
                    table.clone(),
                    format!("Cannot read {}", table),
                ));
            }
            if !perms.all_accessible() {
                result.issues.push(PreflightIssue {
                    title: "Missing ActionKit read access".to_string(),
                    explanation: format!(
                        "{} table(s) missing or not readable: {}",
                        perms.inaccessible_count(),
                        perms.inaccessible_tables.join(", ")
                    ),
                    fixes: vec![
                        format!("Check that --ak-schema ({}) names the ActionKit schema", schema),
                        format!("GRANT SELECT ON ALL TABLES IN SCHEMA {} TO <user>", schema),
                    ],
                });
            }
        }
        Err(e) => {
            result.source_permissions.push(CheckResult::fail(
                "source",
                format!("Failed to check permissions: {}", e),
            ));
        }
    }
}

async fn check_survey_schema(result: &mut PreflightResult, client: &Client, schema: &str) {
    match check_schema_create_privilege(client, schema).await {
        Ok(Some(true)) => {
            result.survey_permissions.push(CheckResult::pass(
                "create",
                format!("CREATE on schema {}", schema),
            ));
        }
        Ok(Some(false)) => {
            result.survey_permissions.push(CheckResult::fail(
                "create",
                format!("No CREATE privilege on schema {}", schema),
            ));
            result.issues.push(PreflightIssue {
                title: "Cannot create survey tables".to_string(),
                explanation: format!("page tables are created in schema {}", schema),
                fixes: vec![format!("GRANT CREATE ON SCHEMA {} TO <user>", schema)],
            });
        }
        Ok(None) => {
            result.survey_permissions.push(
                CheckResult::pass("create", format!("Schema {} does not exist yet", schema))
                    .with_details("It will be created by `ak-survey-sync init` or the first run"),
            );
        }
        Err(e) => {
            result.survey_permissions.push(CheckResult::fail(
                "create",
                format!("Failed to check schema privileges: {}", e),
            ));
        }
    }
}

async fn check_registry<R: PageRegistry>(result: &mut PreflightResult, registry: &R, schema: &str) {
    match registry.verify_registry().await {
        Ok(()) => {
            result.survey_permissions.push(CheckResult::pass(
                "registry",
                format!("Page registry {}.{} is valid", schema, REGISTRY_TABLE),
            ));
        }
        Err(e) => {
            result.survey_permissions.push(CheckResult::fail(
                "registry",
                format!("Page registry {}.{} is not usable", schema, REGISTRY_TABLE),
            ).with_details(e.to_string()));
            result.issues.push(PreflightIssue {
                title: "Page registry missing or invalid".to_string(),
                explanation: e.to_string(),
                fixes: vec![
                    "Run `ak-survey-sync init` to create the registry".to_string(),
                    format!(
                        "Add the missing column(s) to {}.{} (page_id BIGINT, column_list VARCHAR, last_refresh TIMESTAMP)",
                        schema, REGISTRY_TABLE
                    ),
                ],
            });
        }
    }
}
