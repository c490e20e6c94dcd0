//! Fact merger: nine projections → one wide table
//!
//! The projections are outer-joined on project id in a fixed order. Joining
//! one-to-many relations multiplies a project's rows, so the additive
//! `budget` measure is kept on one carrier row per
//! `(project_id, thematic, period)` and zeroed on the others.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::assemble::{
    dedup_by_key, BudgetAttr, ObjectiveAttr, PartnerAttr, PeriodAttr, ProgramTypeAttr,
    ProgrammeAttr, ProgrammeNameAttr, Projections, ScheduleAttr, ThematicAttr,
};
use crate::codes::code_column_width;
use crate::eav::{ProgrammeId, ProjectId};
use crate::lookup::{NutsCentroids, NutsLabels, NutsLevel};

/// One row of `<prefix>_master`, fields in destination column order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactRow {
    pub project_id: ProjectId,
    pub thematic: Option<String>,
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
    pub period: Option<String>,
    pub programme_id: Option<ProgrammeId>,
    pub programme_name: Option<String>,
    pub program_type: Option<String>,
    pub thematic_objective: Option<String>,
    pub investment_priority: Option<String>,
    pub project_start: Option<f64>,
    pub project_end: Option<f64>,
    pub budget: Option<f64>,
    pub nuts0_lat: Option<f64>,
    pub nuts0_lng: Option<f64>,
    pub nuts1_lat: Option<f64>,
    pub nuts1_lng: Option<f64>,
    pub nuts2_lat: Option<f64>,
    pub nuts2_lng: Option<f64>,
    pub nuts3_lat: Option<f64>,
    pub nuts3_lng: Option<f64>,
}

impl FactRow {
    /// A row carrying only its key; every attribute null
    pub fn keyed(project_id: ProjectId) -> Self {
        Self {
            project_id,
            thematic: None,
            partner_id: None,
            country_name: None,
            nuts_0: None,
            nuts_1: None,
            nuts_2: None,
            nuts_3: None,
            partner_lgt: None,
            partner_lat: None,
            is_leader: None,
            is_ext_nuts: None,
            cca2: None,
            lat: None,
            lng: None,
            period: None,
            programme_id: None,
            programme_name: None,
            program_type: None,
            thematic_objective: None,
            investment_priority: None,
            project_start: None,
            project_end: None,
            budget: None,
            nuts0_lat: None,
            nuts0_lng: None,
            nuts1_lat: None,
            nuts1_lng: None,
            nuts2_lat: None,
            nuts2_lng: None,
            nuts3_lat: None,
            nuts3_lng: None,
        }
    }
}

/// A projection row that can be joined onto a fact row
pub trait Attribute {
    fn project_id(&self) -> ProjectId;
    fn fill(&self, row: &mut FactRow);
}

impl Attribute for ThematicAttr {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }
    fn fill(&self, row: &mut FactRow) {
        row.thematic = Some(self.thematic.clone());
    }
}

impl Attribute for PartnerAttr {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }
    fn fill(&self, row: &mut FactRow) {
        row.partner_id = self.partner_id;
        row.country_name = self.country_name.clone();
        row.nuts_0 = self.nuts_0.clone();
        row.nuts_1 = self.nuts_1.clone();
        row.nuts_2 = self.nuts_2.clone();
        row.nuts_3 = self.nuts_3.clone();
        row.partner_lgt = self.partner_lgt;
        row.partner_lat = self.partner_lat;
        row.is_leader = self.is_leader;
        row.is_ext_nuts = self.is_ext_nuts;
        row.cca2 = self.cca2.clone();
        row.lat = self.lat;
        row.lng = self.lng;
    }
}

impl Attribute for PeriodAttr {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }
    fn fill(&self, row: &mut FactRow) {
        row.period = self.period.clone();
    }
}

impl Attribute for ProgrammeAttr {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }
    fn fill(&self, row: &mut FactRow) {
        row.programme_id = self.programme_id;
    }
}

impl Attribute for ProgrammeNameAttr {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }
    fn fill(&self, row: &mut FactRow) {
        row.programme_name = self.programme_name.clone();
    }
}

impl Attribute for ProgramTypeAttr {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }
    fn fill(&self, row: &mut FactRow) {
        row.program_type = Some(self.program_type.clone());
    }
}

impl Attribute for ObjectiveAttr {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }
    fn fill(&self, row: &mut FactRow) {
        row.thematic_objective = self.thematic_objective.clone();
        row.investment_priority = self.investment_priority.clone();
    }
}

impl Attribute for ScheduleAttr {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }
    fn fill(&self, row: &mut FactRow) {
        row.project_start = Some(self.project_start.timestamp() as f64);
        row.project_end = Some(self.project_end.timestamp() as f64);
    }
}

impl Attribute for BudgetAttr {
    fn project_id(&self) -> ProjectId {
        self.project_id
    }
    fn fill(&self, row: &mut FactRow) {
        row.budget = self.budget;
    }
}

/// Rows accumulated so far, grouped by join key
type Wide = BTreeMap<ProjectId, Vec<FactRow>>;

/// Outer join on project id.
///
/// Keys ascend; within a key every left row is combined with every right row
/// in their existing order. A key missing on one side keeps the other side's
/// rows with nulls.
fn outer_join<A: Attribute>(mut acc: Wide, attrs: &[A]) -> Wide {
    let mut right: BTreeMap<ProjectId, Vec<&A>> = BTreeMap::new();
    for attr in attrs {
        right.entry(attr.project_id()).or_default().push(attr);
    }

    let keys: BTreeSet<ProjectId> = acc.keys().chain(right.keys()).copied().collect();
    keys.into_iter()
        .map(|key| {
            let left = acc.remove(&key).unwrap_or_else(|| vec![FactRow::keyed(key)]);
            let rows = match right.get(&key) {
                None => left,
                Some(matches) => left
                    .iter()
                    .flat_map(|base| {
                        matches.iter().map(move |attr| {
                            let mut row = base.clone();
                            attr.fill(&mut row);
                            row
                        })
                    })
                    .collect(),
            };
            (key, rows)
        })
        .collect()
}

/// Budget carrier rank of each row within its `(project_id, thematic, period)`
/// group, counted in table order
fn carrier_ranks(rows: &[FactRow]) -> Vec<usize> {
    let mut seen: HashMap<(ProjectId, Option<&str>, Option<&str>), usize> = HashMap::new();
    rows.iter()
        .map(|row| {
            let count = seen
                .entry((row.project_id, row.thematic.as_deref(), row.period.as_deref()))
                .or_insert(0);
            let rank = *count;
            *count += 1;
            rank
        })
        .collect()
}

/// Zero the budget on every row but the first of its group
pub fn zero_duplicate_budgets(rows: Vec<FactRow>) -> Vec<FactRow> {
    let ranks = carrier_ranks(&rows);
    rows.into_iter()
        .zip(ranks)
        .map(|(row, rank)| {
            if rank == 0 {
                row
            } else {
                FactRow {
                    budget: Some(0.0),
                    ..row
                }
            }
        })
        .collect()
}

/// Counters for best-effort enrichment that found no reference entry
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LookupMisses {
    pub nuts_labels: usize,
    pub nuts_centroids: usize,
}

/// NUTS centroids from the raw codes, then `nuts_0..nuts_2` → labels.
/// `nuts_3` stays a raw code.
fn enrich_nuts(
    rows: Vec<FactRow>,
    labels: &NutsLabels,
    centroids: &NutsCentroids,
    misses: &mut LookupMisses,
) -> Vec<FactRow> {
    let mut centroid = |code: Option<&str>, level: NutsLevel| {
        let found = code.and_then(|c| centroids.centroid(c, level));
        if code.is_some() && found.is_none() {
            misses.nuts_centroids += 1;
        }
        (found.map(|c| c.lat), found.map(|c| c.lng))
    };

    let located: Vec<FactRow> = rows
        .into_iter()
        .map(|row| {
            let (nuts0_lat, nuts0_lng) = centroid(row.nuts_0.as_deref(), NutsLevel::Country);
            let (nuts1_lat, nuts1_lng) = centroid(row.nuts_1.as_deref(), NutsLevel::Region1);
            let (nuts2_lat, nuts2_lng) = centroid(row.nuts_2.as_deref(), NutsLevel::Region2);
            let (nuts3_lat, nuts3_lng) = centroid(row.nuts_3.as_deref(), NutsLevel::Region3);
            FactRow {
                nuts0_lat,
                nuts0_lng,
                nuts1_lat,
                nuts1_lng,
                nuts2_lat,
                nuts2_lng,
                nuts3_lat,
                nuts3_lng,
                ..row
            }
        })
        .collect();

    let mut label = |code: Option<String>| {
        let code = code?;
        let found = labels.label(&code);
        if found.is_none() {
            misses.nuts_labels += 1;
        }
        found
    };

    located
        .into_iter()
        .map(|row| FactRow {
            nuts_0: label(row.nuts_0.clone()),
            nuts_1: label(row.nuts_1.clone()),
            nuts_2: label(row.nuts_2.clone()),
            ..row
        })
        .collect()
}

/// The merged fact table, ready to commit
#[derive(Debug, Clone, PartialEq)]
pub struct MasterTable {
    pub rows: Vec<FactRow>,
    pub misses: LookupMisses,
}

impl MasterTable {
    /// Width for the two normalized-code columns, recomputed on the final rows
    pub fn code_width(&self) -> usize {
        code_column_width(self.rows.iter().flat_map(|row| {
            [
                row.thematic_objective.as_deref(),
                row.investment_priority.as_deref(),
            ]
        }))
    }

    pub fn project_count(&self) -> usize {
        self.rows
            .iter()
            .map(|row| row.project_id)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn budget_total(&self) -> f64 {
        self.rows.iter().filter_map(|row| row.budget).sum()
    }

    /// `sha256:<hex>` over the serialized rows, in order
    pub fn fingerprint(&self) -> Result<String, serde_json::Error> {
        let mut hasher = Sha256::new();
        for row in &self.rows {
            hasher.update(serde_json::to_vec(row)?);
            hasher.update(b"\n");
        }
        Ok(format!("sha256:{:x}", hasher.finalize()))
    }
}

/// Join the projections, de-duplicate, zero fanned-out budgets, enrich NUTS
pub fn merge(
    projections: &Projections,
    labels: &NutsLabels,
    centroids: &NutsCentroids,
) -> MasterTable {
    let wide = Wide::new();
    let wide = outer_join(wide, &projections.thematic);
    let wide = outer_join(wide, &projections.partners);
    let wide = outer_join(wide, &projections.period);
    let wide = outer_join(wide, &projections.programme);
    let wide = outer_join(wide, &projections.programme_name);
    let wide = outer_join(wide, &projections.program_type);
    let wide = outer_join(wide, &projections.objectives);
    let wide = outer_join(wide, &projections.schedule);
    let wide = outer_join(wide, &projections.budget);

    let joined: Vec<FactRow> = wide.into_values().flatten().collect();
    let joined_count = joined.len();

    // f64 has no Hash; its Debug form round-trips exactly
    let unique = dedup_by_key(joined, |row| format!("{:?}", row));
    debug!(
        joined = joined_count,
        unique = unique.len(),
        "removed exact duplicate rows"
    );

    let carried = zero_duplicate_budgets(unique);

    let mut misses = LookupMisses::default();
    let rows = enrich_nuts(carried, labels, centroids, &mut misses);

    info!(
        rows = rows.len(),
        nuts_label_misses = misses.nuts_labels,
        nuts_centroid_misses = misses.nuts_centroids,
        "merged fact table"
    );
    MasterTable { rows, misses }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::Centroid;

    fn thematic(project: i64, name: &str) -> ThematicAttr {
        ThematicAttr {
            project_id: ProjectId(project),
            thematic: name.to_string(),
        }
    }

    fn budget(project: i64, amount: f64) -> BudgetAttr {
        BudgetAttr {
            project_id: ProjectId(project),
            budget: Some(amount),
        }
    }

    fn partner(project: i64, partner_id: i64, nuts: [&str; 4]) -> PartnerAttr {
        PartnerAttr {
            project_id: ProjectId(project),
            partner_id: Some(partner_id),
            country_name: Some("Italy".to_string()),
            nuts_0: Some(nuts[0].to_string()),
            nuts_1: Some(nuts[1].to_string()),
            nuts_2: Some(nuts[2].to_string()),
            nuts_3: Some(nuts[3].to_string()),
            partner_lgt: Some(9.19),
            partner_lat: Some(45.46),
            is_leader: Some(1),
            is_ext_nuts: Some(0),
            cca2: Some(nuts[0].to_string()),
            lat: None,
            lng: None,
        }
    }

    fn labels() -> NutsLabels {
        [
            ("IT", "ITALIA"),
            ("ITC", "NORD-OVEST"),
            ("ITC4", "LOMBARDIA"),
        ]
        .into_iter()
        .map(|(c, d)| (c.to_string(), d.to_string()))
        .collect()
    }

    fn centroids() -> NutsCentroids {
        [
            ("IT", 42.5, 12.5),
            ("ITC", 45.0, 8.0),
            ("ITC4", 45.6, 9.7),
            ("ITC4C", 45.46, 9.19),
        ]
        .into_iter()
        .map(|(c, lat, lng)| (c.to_string(), Centroid { lat, lng }))
        .collect()
    }

    // -------------------------------------------------------------------------
    // OUTER JOIN
    // -------------------------------------------------------------------------

    #[test]
    fn test_outer_join_keeps_keys_from_both_sides() {
        let wide = outer_join(Wide::new(), &[thematic(1, "Energy")]);
        let wide = outer_join(wide, &[budget(2, 50.0)]);
        let rows: Vec<FactRow> = wide.into_values().flatten().collect();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].project_id, ProjectId(1));
        assert_eq!(rows[0].budget, None);
        assert_eq!(rows[1].project_id, ProjectId(2));
        assert_eq!(rows[1].thematic, None);
        assert_eq!(rows[1].budget, Some(50.0));
    }

    #[test]
    fn test_outer_join_multiplies_matches() {
        let wide = outer_join(Wide::new(), &[thematic(1, "A"), thematic(1, "B")]);
        let wide = outer_join(
            wide,
            &[partner(1, 10, ["IT", "ITC", "ITC4", "ITC4C"]), partner(1, 11, ["IT", "ITC", "ITC4", "ITC4C"])],
        );
        let rows: Vec<FactRow> = wide.into_values().flatten().collect();
        let order: Vec<(Option<&str>, Option<i64>)> = rows
            .iter()
            .map(|r| (r.thematic.as_deref(), r.partner_id))
            .collect();
        assert_eq!(
            order,
            vec![(Some("A"), Some(10)), (Some("A"), Some(11)), (Some("B"), Some(10)), (Some("B"), Some(11))]
        );
    }

    #[test]
    fn test_keys_ascend_regardless_of_input_order() {
        let wide = outer_join(Wide::new(), &[budget(3, 1.0), budget(1, 1.0), budget(2, 1.0)]);
        let keys: Vec<ProjectId> = wide.keys().copied().collect();
        assert_eq!(keys, vec![ProjectId(1), ProjectId(2), ProjectId(3)]);
    }

    // -------------------------------------------------------------------------
    // BUDGET CARRIER
    // -------------------------------------------------------------------------

    #[test]
    fn test_budget_kept_once_per_thematic_and_period() {
        let projections = Projections {
            thematic: vec![thematic(1, "A"), thematic(1, "B")],
            partners: vec![
                partner(1, 10, ["IT", "ITC", "ITC4", "ITC4C"]),
                partner(1, 11, ["IT", "ITC", "ITC4", "ITC4C"]),
            ],
            budget: vec![budget(1, 1000.0)],
            ..Projections::default()
        };
        let table = merge(&projections, &labels(), &centroids());

        assert_eq!(table.rows.len(), 4);
        let budgets: Vec<Option<f64>> = table.rows.iter().map(|r| r.budget).collect();
        assert_eq!(budgets, vec![Some(1000.0), Some(0.0), Some(1000.0), Some(0.0)]);
    }

    #[test]
    fn test_one_carrier_per_group() {
        let projections = Projections {
            thematic: vec![thematic(1, "A"), thematic(1, "B"), thematic(2, "A")],
            partners: vec![
                partner(1, 10, ["IT", "ITC", "ITC4", "ITC4C"]),
                partner(1, 11, ["IT", "ITC", "ITC4", "ITC4C"]),
                partner(1, 12, ["IT", "ITC", "ITC4", "ITC4C"]),
                partner(2, 20, ["IT", "ITC", "ITC4", "ITC4C"]),
            ],
            budget: vec![budget(1, 1000.0), budget(2, 300.0)],
            ..Projections::default()
        };
        let table = merge(&projections, &labels(), &centroids());

        let mut per_group: BTreeMap<(ProjectId, Option<String>), Vec<f64>> = BTreeMap::new();
        for row in &table.rows {
            per_group
                .entry((row.project_id, row.thematic.clone()))
                .or_default()
                .push(row.budget.unwrap_or(0.0));
        }
        for (key, budgets) in per_group {
            let carriers = budgets.iter().filter(|b| **b != 0.0).count();
            assert_eq!(carriers, 1, "group {:?}", key);
        }
        assert_eq!(table.budget_total(), 2.0 * 1000.0 + 300.0);
    }

    #[test]
    fn test_zeroing_never_drops_rows() {
        let rows = vec![FactRow::keyed(ProjectId(1)), FactRow::keyed(ProjectId(1))];
        let rows: Vec<FactRow> = rows
            .into_iter()
            .enumerate()
            .map(|(i, r)| FactRow {
                partner_id: Some(i as i64),
                budget: Some(10.0),
                ..r
            })
            .collect();
        let zeroed = zero_duplicate_budgets(rows);
        assert_eq!(zeroed.len(), 2);
        assert_eq!(zeroed[0].budget, Some(10.0));
        assert_eq!(zeroed[1].budget, Some(0.0));
        assert_eq!(zeroed[1].partner_id, Some(1));
    }

    #[test]
    fn test_zeroing_is_idempotent() {
        let projections = Projections {
            thematic: vec![thematic(1, "A"), thematic(1, "B")],
            partners: vec![
                partner(1, 10, ["IT", "ITC", "ITC4", "ITC4C"]),
                partner(1, 11, ["IT", "ITC", "ITC4", "ITC4C"]),
            ],
            budget: vec![budget(1, 1000.0)],
            ..Projections::default()
        };
        let once = merge(&projections, &labels(), &centroids());
        let twice = zero_duplicate_budgets(once.rows.clone());
        assert_eq!(once.rows, twice);
    }

    fn objectives_with_budget(amount: Option<f64>) -> Projections {
        Projections {
            objectives: vec![
                ObjectiveAttr {
                    project_id: ProjectId(1),
                    thematic_objective: Some("(01)Research".to_string()),
                    investment_priority: None,
                },
                ObjectiveAttr {
                    project_id: ProjectId(1),
                    thematic_objective: Some("(04)Energy".to_string()),
                    investment_priority: None,
                },
            ],
            budget: vec![BudgetAttr {
                project_id: ProjectId(1),
                budget: amount,
            }],
            ..Projections::default()
        }
    }

    #[test]
    fn test_null_budget_carrier_stays_null() {
        let table = merge(&objectives_with_budget(None), &labels(), &centroids());
        let budgets: Vec<Option<f64>> = table.rows.iter().map(|r| r.budget).collect();
        assert_eq!(budgets, vec![None, Some(0.0)]);
        assert_eq!(table.budget_total(), 0.0);
    }

    #[test]
    fn test_zero_budget_stays_zero() {
        let table = merge(&objectives_with_budget(Some(0.0)), &labels(), &centroids());
        let budgets: Vec<Option<f64>> = table.rows.iter().map(|r| r.budget).collect();
        assert_eq!(budgets, vec![Some(0.0), Some(0.0)]);
    }

    #[test]
    fn test_exact_duplicates_removed() {
        let projections = Projections {
            thematic: vec![thematic(1, "A"), thematic(1, "A")],
            budget: vec![budget(1, 5.0)],
            ..Projections::default()
        };
        let table = merge(&projections, &labels(), &centroids());
        assert_eq!(table.rows.len(), 1);
        assert_eq!(table.rows[0].budget, Some(5.0));
    }

    // -------------------------------------------------------------------------
    // NUTS ENRICHMENT
    // -------------------------------------------------------------------------

    #[test]
    fn test_nuts_labels_and_centroids() {
        let projections = Projections {
            partners: vec![partner(1, 10, ["IT", "ITC", "ITC4", "ITC4C"])],
            ..Projections::default()
        };
        let table = merge(&projections, &labels(), &centroids());
        let row = &table.rows[0];

        assert_eq!(row.nuts_0.as_deref(), Some("[IT] - Italia"));
        assert_eq!(row.nuts_1.as_deref(), Some("[ITC] - Nord-ovest"));
        assert_eq!(row.nuts_2.as_deref(), Some("[ITC4] - Lombardia"));
        assert_eq!(row.nuts_3.as_deref(), Some("ITC4C"));
        assert_eq!((row.nuts0_lat, row.nuts0_lng), (Some(42.5), Some(12.5)));
        assert_eq!((row.nuts1_lat, row.nuts1_lng), (Some(45.0), Some(8.0)));
        assert_eq!((row.nuts2_lat, row.nuts2_lng), (Some(45.6), Some(9.7)));
        assert_eq!((row.nuts3_lat, row.nuts3_lng), (Some(45.46), Some(9.19)));
        assert_eq!(table.misses, LookupMisses::default());
    }

    #[test]
    fn test_unknown_nuts_code_is_null() {
        let projections = Projections {
            partners: vec![partner(1, 10, ["DE", "DE1", "DE11", "DE111"])],
            ..Projections::default()
        };
        let table = merge(&projections, &labels(), &centroids());
        let row = &table.rows[0];

        assert_eq!(row.nuts_0, None);
        assert_eq!(row.nuts_2, None);
        assert_eq!(row.nuts_3.as_deref(), Some("DE111"));
        assert_eq!(row.nuts3_lat, None);
        assert_eq!(table.misses.nuts_labels, 3);
        assert_eq!(table.misses.nuts_centroids, 4);
    }

    // -------------------------------------------------------------------------
    // TABLE METRICS
    // -------------------------------------------------------------------------

    #[test]
    fn test_code_width_covers_both_columns() {
        let projections = Projections {
            objectives: vec![ObjectiveAttr {
                project_id: ProjectId(1),
                thematic_objective: Some("(01)R".to_string()),
                investment_priority: Some("(01a) Longer label".to_string()),
            }],
            ..Projections::default()
        };
        let table = merge(&projections, &labels(), &centroids());
        assert_eq!(table.code_width(), "(01a) Longer label".chars().count());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let projections = Projections {
            thematic: vec![thematic(1, "A")],
            budget: vec![budget(1, 5.0)],
            ..Projections::default()
        };
        let a = merge(&projections, &labels(), &centroids()).fingerprint().unwrap();
        let b = merge(&projections, &labels(), &centroids()).fingerprint().unwrap();
        assert_eq!(a, b);
        assert!(a.starts_with("sha256:"));
    }
}
