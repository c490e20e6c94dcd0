//! The nine attribute projections merged into the fact table
//!
//! Each projection is keyed on project id. Programme-level attributes
//! (period, name, program type, objectives) are computed per programme and
//! then fanned out to every project of that programme. Rows without a
//! usable join key never leave this module.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::codes::normalize_optional;
use crate::eav::{program_types, ProgrammeId, ProjectEntity, ProjectId};
use crate::lookup::{cca2_alias, ReferenceData};
use crate::source::{PartnerRow, ProgrammeRow, SourceTables};

#[derive(Debug, Clone, PartialEq)]
pub struct ThematicAttr {
    pub project_id: ProjectId,
    pub thematic: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartnerAttr {
    pub project_id: ProjectId,
    pub partner_id: Option<i64>,
    pub country_name: Option<String>,
    pub nuts_0: Option<String>,
    pub nuts_1: Option<String>,
    pub nuts_2: Option<String>,
    pub nuts_3: Option<String>,
    pub partner_lgt: Option<f64>,
    pub partner_lat: Option<f64>,
    pub is_leader: Option<i16>,
    pub is_ext_nuts: Option<i16>,
    pub cca2: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeriodAttr {
    pub project_id: ProjectId,
    pub period: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgrammeAttr {
    pub project_id: ProjectId,
    pub programme_id: Option<ProgrammeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgrammeNameAttr {
    pub project_id: ProjectId,
    pub programme_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgramTypeAttr {
    pub project_id: ProjectId,
    pub program_type: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectiveAttr {
    pub project_id: ProjectId,
    pub thematic_objective: Option<String>,
    pub investment_priority: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduleAttr {
    pub project_id: ProjectId,
    pub project_start: DateTime<Utc>,
    pub project_end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BudgetAttr {
    pub project_id: ProjectId,
    pub budget: Option<f64>,
}

/// All nine projections, in merge order
#[derive(Debug, Default, Clone)]
pub struct Projections {
    pub thematic: Vec<ThematicAttr>,
    pub partners: Vec<PartnerAttr>,
    pub period: Vec<PeriodAttr>,
    pub programme: Vec<ProgrammeAttr>,
    pub programme_name: Vec<ProgrammeNameAttr>,
    pub program_type: Vec<ProgramTypeAttr>,
    pub objectives: Vec<ObjectiveAttr>,
    pub schedule: Vec<ScheduleAttr>,
    pub budget: Vec<BudgetAttr>,
}

pub fn assemble(sources: &SourceTables, reference: &ReferenceData) -> Projections {
    let project_programme = project_programme(sources);

    let projections = Projections {
        thematic: thematic(sources),
        partners: partners(&sources.partners, reference),
        period: period(sources, &project_programme),
        programme: programme(sources),
        programme_name: programme_name(sources, &project_programme),
        program_type: program_type(sources, &project_programme),
        objectives: objectives(sources, &project_programme),
        schedule: schedule(sources),
        budget: budget(sources),
    };

    info!(
        thematic = projections.thematic.len(),
        partners = projections.partners.len(),
        period = projections.period.len(),
        programme = projections.programme.len(),
        programme_name = projections.programme_name.len(),
        program_type = projections.program_type.len(),
        objectives = projections.objectives.len(),
        schedule = projections.schedule.len(),
        budget = projections.budget.len(),
        "assembled projections"
    );
    projections
}

// =============================================================================
// Helpers
// =============================================================================

/// Keep the first occurrence of every key, preserving order
pub(crate) fn dedup_by_key<T, K, F>(rows: Vec<T>, key: F) -> Vec<T>
where
    K: Hash + Eq,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::new();
    rows.into_iter().filter(|row| seen.insert(key(row))).collect()
}

/// Project → programme for every project with both ids set
fn project_programme(sources: &SourceTables) -> Vec<(ProjectId, ProgrammeId)> {
    sources
        .projects
        .iter()
        .filter_map(|p| Some((ProjectId(p.pid?), ProgrammeId(p.programme_id?))))
        .collect()
}

/// Spread programme-grain rows over the projects of each programme
fn fan_out<T: Clone>(
    by_programme: Vec<(ProgrammeId, T)>,
    project_programme: &[(ProjectId, ProgrammeId)],
) -> Vec<(ProjectId, T)> {
    let mut grouped: HashMap<ProgrammeId, Vec<T>> = HashMap::new();
    for (programme_id, value) in by_programme {
        grouped.entry(programme_id).or_default().push(value);
    }

    project_programme
        .iter()
        .flat_map(|(project_id, programme_id)| {
            grouped
                .get(programme_id)
                .into_iter()
                .flatten()
                .map(move |value| (*project_id, value.clone()))
        })
        .collect()
}

/// Programmes flagged "use for statistics", with their rows
fn statistics_programmes(
    sources: &SourceTables,
) -> impl Iterator<Item = (ProgrammeId, &ProgrammeRow)> {
    sources
        .programmes
        .iter()
        .filter(|p| p.use_for_statistics == Some(true))
        .filter_map(|p| Some((ProgrammeId(p.id?), p)))
}

// =============================================================================
// Project-grain projections
// =============================================================================

fn thematic(sources: &SourceTables) -> Vec<ThematicAttr> {
    let project_terms = sources.keywords.project::<ProjectEntity>();
    sources
        .terms
        .label(&project_terms)
        .into_iter()
        .map(|(project_id, thematic)| ThematicAttr { project_id, thematic })
        .collect()
}

fn partners(rows: &[PartnerRow], reference: &ReferenceData) -> Vec<PartnerAttr> {
    // f64 has no Hash; its Debug form round-trips exactly
    let unique = dedup_by_key(rows.to_vec(), |row| format!("{:?}", row));

    let mut country_misses = 0usize;
    let partners: Vec<PartnerAttr> = unique
        .into_iter()
        .filter_map(|row| {
            let project_id = ProjectId(row.project_id?);
            let cca2 = row.region_0.as_deref().map(|code| cca2_alias(code).to_string());
            let centroid = cca2
                .as_deref()
                .and_then(|code| reference.countries.centroid(code));
            if cca2.is_some() && centroid.is_none() {
                country_misses += 1;
            }
            Some(PartnerAttr {
                project_id,
                partner_id: row.pid,
                country_name: row.country,
                nuts_0: row.region_0,
                nuts_1: row.region_1,
                nuts_2: row.region_2,
                nuts_3: row.region_3,
                partner_lgt: row.geocoding_x,
                partner_lat: row.geocoding_y,
                is_leader: row.partnership_type,
                is_ext_nuts: row.is_ext_nuts,
                cca2,
                lat: centroid.map(|c| c.lat),
                lng: centroid.map(|c| c.lng),
            })
        })
        .collect();

    if country_misses > 0 {
        debug!(country_misses, "partner countries without a centroid");
    }
    partners
}

fn programme(sources: &SourceTables) -> Vec<ProgrammeAttr> {
    sources
        .projects
        .iter()
        .filter_map(|p| {
            Some(ProgrammeAttr {
                project_id: ProjectId(p.pid?),
                programme_id: p.programme_id.map(ProgrammeId),
            })
        })
        .collect()
}

/// Projects with both instants set; a raw 0 means unset, not the epoch
fn schedule(sources: &SourceTables) -> Vec<ScheduleAttr> {
    fn instant(raw: Option<i64>) -> Option<DateTime<Utc>> {
        raw.filter(|secs| *secs != 0)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    sources
        .projects
        .iter()
        .filter_map(|p| {
            Some(ScheduleAttr {
                project_id: ProjectId(p.pid?),
                project_start: instant(p.project_start)?,
                project_end: instant(p.project_end)?,
            })
        })
        .collect()
}

fn budget(sources: &SourceTables) -> Vec<BudgetAttr> {
    sources
        .projects
        .iter()
        .filter_map(|p| {
            Some(BudgetAttr {
                project_id: ProjectId(p.pid?),
                budget: p.budget,
            })
        })
        .collect()
}

// =============================================================================
// Programme-grain projections, fanned out to projects
// =============================================================================

fn period(
    sources: &SourceTables,
    project_programme: &[(ProjectId, ProgrammeId)],
) -> Vec<PeriodAttr> {
    let mut periods_by_type: HashMap<&str, Vec<Option<String>>> = HashMap::new();
    for row in &sources.programme_types {
        if let Some(programme_type) = row.programme_type.as_deref() {
            periods_by_type
                .entry(programme_type)
                .or_default()
                .push(row.period.clone());
        }
    }

    let by_programme: Vec<(ProgrammeId, Option<String>)> = statistics_programmes(sources)
        .filter_map(|(id, p)| Some((id, periods_by_type.get(p.programme_type.as_deref()?)?)))
        .flat_map(|(id, periods)| periods.iter().map(move |period| (id, period.clone())))
        .collect();

    fan_out(by_programme, project_programme)
        .into_iter()
        .map(|(project_id, period)| PeriodAttr { project_id, period })
        .collect()
}

fn programme_name(
    sources: &SourceTables,
    project_programme: &[(ProjectId, ProgrammeId)],
) -> Vec<ProgrammeNameAttr> {
    let by_programme: Vec<(ProgrammeId, Option<String>)> = statistics_programmes(sources)
        .map(|(id, p)| (id, p.title.clone()))
        .collect();

    fan_out(by_programme, project_programme)
        .into_iter()
        .map(|(project_id, programme_name)| ProgrammeNameAttr {
            project_id,
            programme_name,
        })
        .collect()
}

fn program_type(
    sources: &SourceTables,
    project_programme: &[(ProjectId, ProgrammeId)],
) -> Vec<ProgramTypeAttr> {
    let by_programme = program_types(&sources.strand, &sources.source, &sources.terms);

    fan_out(by_programme, project_programme)
        .into_iter()
        .map(|(project_id, program_type)| ProgramTypeAttr {
            project_id,
            program_type,
        })
        .collect()
}

/// Normalized objective/priority pairs; duplicates and all-null pairs dropped
fn objectives(
    sources: &SourceTables,
    project_programme: &[(ProjectId, ProgrammeId)],
) -> Vec<ObjectiveAttr> {
    let normalized: Vec<(ProgrammeId, (Option<String>, Option<String>))> = sources
        .sotoip
        .iter()
        .filter_map(|row| {
            let pair = (
                normalize_optional(row.thematic_objective.as_deref()),
                normalize_optional(row.investment_priority.as_deref()),
            );
            if pair.0.is_none() && pair.1.is_none() {
                return None;
            }
            Some((ProgrammeId(row.programme_id?), pair))
        })
        .collect();
    let by_programme = dedup_by_key(normalized, |row| row.clone());

    fan_out(by_programme, project_programme)
        .into_iter()
        .map(|(project_id, (thematic_objective, investment_priority))| ObjectiveAttr {
            project_id,
            thematic_objective,
            investment_priority,
        })
        .collect()
}
