//! Enrichment module registry.
//!
//! One [`ModuleSpec`] per entity kind describes everything the orchestrator
//! needs: destination table and write mode, field allow-list, prompts,
//! reference rows to show the model, and how to link records to companies.

use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::persist::{self, FieldKind, FieldSpec, TableSpec, WriteMode};
use crate::schema::TableSchema;

pub const MAX_COUNT: usize = 50;

pub const COMPANIES_TABLE: &str = "companies";

pub const DEFAULT_COUNTRIES: &[&str] = &["Nigeria", "Kenya", "Ghana", "South Africa"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleKind {
    Companies,
    Deals,
    Investors,
    Grants,
    ClinicalTrials,
    RegulatoryBodies,
    ClinicalCenters,
    Investigators,
    MarketIndicators,
}

impl ModuleKind {
    /// Run-all order: entity creators before the modules that reference them.
    pub const ALL: [ModuleKind; 9] = [
        ModuleKind::Companies,
        ModuleKind::Deals,
        ModuleKind::Investors,
        ModuleKind::Grants,
        ModuleKind::ClinicalTrials,
        ModuleKind::RegulatoryBodies,
        ModuleKind::ClinicalCenters,
        ModuleKind::Investigators,
        ModuleKind::MarketIndicators,
    ];

    pub fn name(&self) -> &'static str {
        self.spec().name
    }

    pub fn spec(&self) -> &'static ModuleSpec {
        match self {
            ModuleKind::Companies => &COMPANIES,
            ModuleKind::Deals => &DEALS,
            ModuleKind::Investors => &INVESTORS,
            ModuleKind::Grants => &GRANTS,
            ModuleKind::ClinicalTrials => &CLINICAL_TRIALS,
            ModuleKind::RegulatoryBodies => &REGULATORY_BODIES,
            ModuleKind::ClinicalCenters => &CLINICAL_CENTERS,
            ModuleKind::Investigators => &INVESTIGATORS,
            ModuleKind::MarketIndicators => &MARKET_INDICATORS,
        }
    }
}

impl fmt::Display for ModuleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("Unknown module: {0}")]
pub struct UnknownModule(pub String);

impl FromStr for ModuleKind {
    type Err = UnknownModule;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let kind = match s.trim().to_lowercase().replace('-', "_").as_str() {
            "companies" => ModuleKind::Companies,
            "deals" => ModuleKind::Deals,
            "investors" => ModuleKind::Investors,
            "grants" => ModuleKind::Grants,
            "clinical_trials" | "trials" => ModuleKind::ClinicalTrials,
            "regulatory_bodies" | "regulatory" | "regulatory_ecosystem" => {
                ModuleKind::RegulatoryBodies
            }
            "clinical_centers" | "centers" => ModuleKind::ClinicalCenters,
            "investigators" => ModuleKind::Investigators,
            "market_indicators" | "nation_pulse_data" | "metrics" => ModuleKind::MarketIndicators,
            _ => return Err(UnknownModule(s.to_string())),
        };
        Ok(kind)
    }
}

/// Existing rows loaded before dispatch and shown to the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    None,
    /// The least recently updated companies, offered for update.
    StaleCompanies,
    /// Known companies the model may attach records to.
    Companies,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReferenceRow {
    pub id: i64,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
}

#[derive(Debug)]
pub struct ModuleSpec {
    pub kind: ModuleKind,
    pub name: &'static str,
    /// Key holding the written rows in the HTTP response.
    pub response_key: &'static str,
    pub default_count: usize,
    pub table: TableSpec,
    pub system_prompt: &'static str,
    /// What the model is asked for, used for retrieval too.
    pub topic: &'static str,
    pub reference: Reference,
    /// Record field naming a company; resolved into `company_id`.
    pub company_link: Option<&'static str>,
}

/// Everything a prompt is built from.
pub struct PromptInput<'a> {
    pub count: usize,
    pub countries: &'a [String],
    pub reference: &'a [ReferenceRow],
}

impl ModuleSpec {
    pub fn retrieval_query(&self, countries: &[String]) -> String {
        if self.kind == ModuleKind::MarketIndicators && !countries.is_empty() {
            format!("{} {}", self.topic, countries.join(" "))
        } else {
            self.topic.to_string()
        }
    }

    pub fn user_prompt(&self, input: &PromptInput<'_>) -> String {
        let reference_json = serde_json::to_string(input.reference).unwrap_or_default();
        let updating = self.reference == Reference::StaleCompanies && !input.reference.is_empty();

        let task = match self.kind {
            ModuleKind::Companies if updating => format!(
                "Update these existing {} with factual information. Keep each company's \"id\" \
                 and include only fields you are confident about.\n\nCompanies to update:\n{}\n\n\
                 You may also add up to {} companies that are not listed; omit \"id\" for those.",
                self.topic, reference_json, input.count
            ),
            ModuleKind::MarketIndicators => {
                let countries = if input.countries.is_empty() {
                    DEFAULT_COUNTRIES.join(", ")
                } else {
                    input.countries.join(", ")
                };
                format!(
                    "Provide {} for these African countries: {}. Give {} metrics per country, \
                     using published figures from WHO, World Bank, UN and national statistics offices.",
                    self.topic, countries, input.count
                )
            }
            _ if !input.reference.is_empty() => format!(
                "Provide {} real {}. Where relevant, use these known companies: {}",
                input.count, self.topic, reference_json
            ),
            _ => format!("Provide {} real {}.", input.count, self.topic),
        };

        format!(
            "{}\n\nReturn ONLY a JSON array of objects shaped like this:\n```json\n[\n{}\n]\n```",
            task,
            self.example_object(updating)
        )
    }

    fn example_object(&self, with_id: bool) -> String {
        let mut lines = Vec::new();
        if with_id {
            lines.push("    \"id\": 1".to_string());
        }
        for field in self.table.fields {
            if field.name == "company_id" {
                continue;
            }
            let sample = match field.kind {
                FieldKind::Text => "\"...\"",
                FieldKind::Integer => "0",
                FieldKind::Real => "0.0",
                FieldKind::JsonList => "[\"...\"]",
            };
            lines.push(format!("    \"{}\": {}", field.name, sample));
        }
        format!("  {{\n{}\n  }}", lines.join(",\n"))
    }

    /// Updates may only target rows that were offered to the model.
    pub fn check_update_target(
        &self,
        value: &Value,
        reference: &[ReferenceRow],
    ) -> Result<(), String> {
        if self.table.write_mode != WriteMode::InsertOrUpdateById {
            return Ok(());
        }
        let Some(id) = value.get("id").filter(|v| !v.is_null()) else {
            return Ok(());
        };
        let parsed = id
            .as_i64()
            .or_else(|| id.as_str().and_then(|s| s.trim().parse().ok()));
        match parsed {
            Some(id) if reference.iter().any(|r| r.id == id) => Ok(()),
            _ => Err(format!("id {} was not offered for update", id)),
        }
    }

    /// Natural key for logs and results, naming updated rows by their stored name.
    pub fn display_key(&self, value: &Value, reference: &[ReferenceRow]) -> Option<String> {
        let key = persist::natural_key(value, &self.table)?;
        if let Some(id) = key.strip_prefix('#').and_then(|s| s.parse::<i64>().ok()) {
            if let Some(row) = reference.iter().find(|r| r.id == id) {
                return Some(row.name.clone());
            }
        }
        Some(key)
    }

    /// Replace any model-supplied `company_id` with the id of the company
    /// named by `company_link`, when one exists.
    pub async fn resolve_company_link(
        &self,
        pool: &SqlitePool,
        value: &mut Value,
    ) -> Result<(), sqlx::Error> {
        let Some(link) = self.company_link else {
            return Ok(());
        };
        let Some(obj) = value.as_object_mut() else {
            return Ok(());
        };
        obj.remove("company_id");

        let name = match obj.get(link).and_then(Value::as_str).map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Ok(()),
        };
        let id: Option<i64> =
            sqlx::query_scalar("SELECT id FROM companies WHERE name = ? COLLATE NOCASE LIMIT 1")
                .bind(&name)
                .fetch_optional(pool)
                .await?;
        if let Some(id) = id {
            obj.insert("company_id".to_string(), Value::from(id));
        }
        Ok(())
    }
}

/// Rows the model is shown before it generates.
///
/// The query is built from the live `companies` columns: `sector` and
/// `country` are read only when present, and staleness falls back to rowid
/// order on tables without `updated_at`.
pub async fn load_reference(
    pool: &SqlitePool,
    reference: Reference,
    count: usize,
    companies: &TableSchema,
) -> Result<Vec<ReferenceRow>, sqlx::Error> {
    if reference == Reference::None || !companies.has("name") {
        return Ok(Vec::new());
    }
    let optional = |column: &str| {
        if companies.has(column) {
            column.to_string()
        } else {
            "NULL".to_string()
        }
    };

    let (columns, order, limit) = match reference {
        Reference::StaleCompanies => {
            let order = if companies.has("updated_at") {
                "updated_at ASC, rowid ASC"
            } else {
                "rowid ASC"
            };
            (format!("{}, {}", optional("sector"), optional("country")), order, count)
        }
        _ => ("NULL, NULL".to_string(), "rowid ASC", 20),
    };
    let sql = format!(
        "SELECT rowid, name, {} FROM {} ORDER BY {} LIMIT ?",
        columns, COMPANIES_TABLE, order
    );

    let rows: Vec<(i64, Option<String>, Option<String>, Option<String>)> = sqlx::query_as(&sql)
        .bind(limit as i64)
        .fetch_all(pool)
        .await?;

    Ok(rows
        .into_iter()
        .filter_map(|(id, name, sector, country)| {
            name.map(|name| ReferenceRow {
                id,
                name,
                sector,
                country,
            })
        })
        .collect())
}

// ============ Module table ============

use crate::persist::FieldKind::{Integer, JsonList, Real, Text};

const COMPANY_FIELDS: &[FieldSpec] = &[
    FieldSpec::new("name", Text),
    FieldSpec::new("description", Text),
    FieldSpec::new("website", Text),
    FieldSpec::new("industry", Text),
    FieldSpec::new("sector", Text),
    FieldSpec::new("stage", Text),
    FieldSpec::new("founded_year", Integer),
    FieldSpec::new("employees_count", Integer),
    FieldSpec::new("headquarters", Text),
    FieldSpec::new("country", Text),
    FieldSpec::new("funding_stage", Text),
    FieldSpec::new("total_funding", Real),
    FieldSpec::new("last_funding_date", Text),
    FieldSpec::new("investors", JsonList),
    FieldSpec::new("products", JsonList),
    FieldSpec::new("markets", JsonList),
    FieldSpec::new("achievements", JsonList),
];

static COMPANIES: ModuleSpec = ModuleSpec {
    kind: ModuleKind::Companies,
    name: "companies",
    response_key: "companies",
    default_count: 10,
    table: TableSpec {
        table: COMPANIES_TABLE,
        natural_key: &["name"],
        write_mode: WriteMode::InsertOrUpdateById,
        fields: COMPANY_FIELDS,
    },
    system_prompt: "You are an expert in African healthcare startups. Use only real, factual \
        information. If you do not know a field, leave it out or use null.",
    topic: "African healthcare startup companies",
    reference: Reference::StaleCompanies,
    company_link: None,
};

static DEALS: ModuleSpec = ModuleSpec {
    kind: ModuleKind::Deals,
    name: "deals",
    response_key: "deals",
    default_count: 10,
    table: TableSpec {
        table: "deals",
        natural_key: &["company_name"],
        write_mode: WriteMode::Insert,
        fields: &[
            FieldSpec::new("company_id", Integer),
            FieldSpec::new("company_name", Text),
            FieldSpec::new("deal_type", Text),
            FieldSpec::new("amount", Real),
            FieldSpec::new("valuation", Real),
            FieldSpec::new("lead_investor", Text),
            FieldSpec::new("participants", JsonList),
            FieldSpec::new("deal_date", Text),
            FieldSpec::new("status", Text),
            FieldSpec::new("sector", Text),
            FieldSpec::new("country", Text),
            FieldSpec::new("description", Text),
        ],
    },
    system_prompt: "You are an expert in African healthcare investment deals. Report only deals \
        that actually happened, with realistic amounts and valuations.",
    topic: "investment deals for African healthcare companies",
    reference: Reference::Companies,
    company_link: Some("company_name"),
};

static INVESTORS: ModuleSpec = ModuleSpec {
    kind: ModuleKind::Investors,
    name: "investors",
    response_key: "investors",
    default_count: 5,
    table: TableSpec {
        table: "investors",
        natural_key: &["name"],
        write_mode: WriteMode::Insert,
        fields: &[
            FieldSpec::new("name", Text),
            FieldSpec::new("description", Text),
            FieldSpec::new("type", Text),
            FieldSpec::new("headquarters", Text),
            FieldSpec::new("founded_year", Integer),
            FieldSpec::new("assets_under_management", Real),
            FieldSpec::new("website", Text),
            FieldSpec::new("focus_sectors", JsonList),
            FieldSpec::new("investment_stages", JsonList),
            FieldSpec::new("countries", JsonList),
            FieldSpec::new("team_size", Integer),
            FieldSpec::new("contact_email", Text),
        ],
    },
    system_prompt: "You are an expert in African healthcare investment. List only investors that \
        exist; return fewer results rather than invented ones.",
    topic: "African healthcare investors (VC firms, angels, corporate investors)",
    reference: Reference::None,
    company_link: None,
};

static GRANTS: ModuleSpec = ModuleSpec {
    kind: ModuleKind::Grants,
    name: "grants",
    response_key: "grants",
    default_count: 5,
    table: TableSpec {
        table: "grants",
        natural_key: &["title"],
        write_mode: WriteMode::Insert,
        fields: &[
            FieldSpec::new("title", Text),
            FieldSpec::new("description", Text),
            FieldSpec::new("funding_agency", Text),
            FieldSpec::new("amount", Real),
            FieldSpec::new("grant_type", Text),
            FieldSpec::new("application_deadline", Text),
            FieldSpec::new("status", Text),
            FieldSpec::new("country", Text),
            FieldSpec::new("sector", Text),
            FieldSpec::new("duration_months", Integer),
            FieldSpec::new("funders", JsonList),
            FieldSpec::new("eligibility_criteria", JsonList),
            FieldSpec::new("requirements", Text),
        ],
    },
    system_prompt: "You are an expert in healthcare research funding in Africa. List only grants \
        offered by real funding agencies.",
    topic: "healthcare research grants for African countries",
    reference: Reference::None,
    company_link: None,
};

static CLINICAL_TRIALS: ModuleSpec = ModuleSpec {
    kind: ModuleKind::ClinicalTrials,
    name: "clinical_trials",
    response_key: "trials",
    default_count: 5,
    table: TableSpec {
        table: "clinical_trials",
        natural_key: &["title"],
        write_mode: WriteMode::Insert,
        fields: &[
            FieldSpec::new("title", Text),
            FieldSpec::new("description", Text),
            FieldSpec::new("phase", Text),
            FieldSpec::new("medical_condition", Text),
            FieldSpec::new("indication", Text),
            FieldSpec::new("intervention", Text),
            FieldSpec::new("sponsor", Text),
            FieldSpec::new("location", Text),
            FieldSpec::new("country", Text),
            FieldSpec::new("start_date", Text),
            FieldSpec::new("end_date", Text),
            FieldSpec::new("status", Text),
            FieldSpec::new("nct_number", Text),
            FieldSpec::new("company_id", Integer),
        ],
    },
    system_prompt: "You are an expert in clinical research. List only trials registered or \
        conducted in Africa, with their registry numbers when known.",
    topic: "clinical trials conducted in Africa",
    reference: Reference::Companies,
    company_link: Some("sponsor"),
};

static REGULATORY_BODIES: ModuleSpec = ModuleSpec {
    kind: ModuleKind::RegulatoryBodies,
    name: "regulatory_bodies",
    response_key: "bodies",
    default_count: 5,
    table: TableSpec {
        table: "regulatory_bodies",
        natural_key: &["name"],
        write_mode: WriteMode::Insert,
        fields: &[
            FieldSpec::new("name", Text),
            FieldSpec::new("country", Text),
            FieldSpec::new("abbreviation", Text),
            FieldSpec::new("website", Text),
            FieldSpec::new("description", Text),
            FieldSpec::new("jurisdiction", Text),
        ],
    },
    system_prompt: "You are an expert in African healthcare regulation. List only regulatory \
        agencies that exist, such as NAFDAC in Nigeria.",
    topic: "African healthcare regulatory bodies",
    reference: Reference::None,
    company_link: None,
};

static CLINICAL_CENTERS: ModuleSpec = ModuleSpec {
    kind: ModuleKind::ClinicalCenters,
    name: "clinical_centers",
    response_key: "centers",
    default_count: 5,
    table: TableSpec {
        table: "clinical_centers",
        natural_key: &["name"],
        write_mode: WriteMode::Insert,
        fields: &[
            FieldSpec::new("name", Text),
            FieldSpec::new("country", Text),
            FieldSpec::new("city", Text),
            FieldSpec::new("address", Text),
            FieldSpec::new("website", Text),
            FieldSpec::new("description", Text),
            FieldSpec::new("specialties", JsonList),
            FieldSpec::new("phases_supported", JsonList),
            FieldSpec::new("capacity_patients", Integer),
            FieldSpec::new("established_year", Integer),
        ],
    },
    system_prompt: "You are an expert in African clinical research. List only real hospitals, \
        universities and research institutions that run clinical trials.",
    topic: "clinical research centers in Africa",
    reference: Reference::None,
    company_link: None,
};

static INVESTIGATORS: ModuleSpec = ModuleSpec {
    kind: ModuleKind::Investigators,
    name: "investigators",
    response_key: "investigators",
    default_count: 5,
    table: TableSpec {
        table: "investigators",
        natural_key: &["name"],
        write_mode: WriteMode::Insert,
        fields: &[
            FieldSpec::new("name", Text),
            FieldSpec::new("title", Text),
            FieldSpec::aliased("institution", Text, &["affiliation"]),
            FieldSpec::new("country", Text),
            FieldSpec::new("city", Text),
            FieldSpec::new("email", Text),
            FieldSpec::new("phone", Text),
            FieldSpec::aliased("specialties", JsonList, &["specialization"]),
            FieldSpec::new("therapeutic_areas", JsonList),
            FieldSpec::aliased("experience_years", Integer, &["years_experience"]),
            FieldSpec::new("education", JsonList),
            FieldSpec::new("certifications", JsonList),
        ],
    },
    system_prompt: "You are an expert in African clinical research. List only real principal \
        investigators at real institutions.",
    topic: "clinical investigators in Africa",
    reference: Reference::None,
    company_link: None,
};

static MARKET_INDICATORS: ModuleSpec = ModuleSpec {
    kind: ModuleKind::MarketIndicators,
    name: "market_indicators",
    response_key: "metrics",
    default_count: 5,
    table: TableSpec {
        table: "market_indicators",
        natural_key: &["country", "metric_name", "year"],
        write_mode: WriteMode::Upsert {
            conflict: &["country", "metric_name", "year"],
        },
        fields: &[
            FieldSpec::new("country", Text),
            FieldSpec::new("data_type", Text),
            FieldSpec::new("metric_name", Text),
            FieldSpec::new("metric_value", Real),
            FieldSpec::new("metric_unit", Text),
            FieldSpec::new("year", Integer),
            FieldSpec::new("source", Text),
        ],
    },
    system_prompt: "You are an expert in African health and economic statistics. Use only \
        published figures and name the source.",
    topic: "health and economic indicators",
    reference: Reference::None,
    company_link: None,
};
