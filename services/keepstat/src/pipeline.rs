//! One reconciliation run: source tables → fact table
//!
//! Pure and deterministic: the same `SourceTables` and reference data always
//! give the same rows in the same order.

use tracing::info;

use crate::assemble::assemble;
use crate::lookup::ReferenceData;
use crate::merge::{merge, MasterTable};
use crate::source::SourceTables;

/// Reference data is injected once per run
pub struct Pipeline {
    reference: ReferenceData,
}

impl Pipeline {
    pub fn new(reference: ReferenceData) -> Self {
        Self { reference }
    }

    pub fn build(&self, sources: &SourceTables) -> MasterTable {
        info!(
            programmes = sources.programmes.len(),
            projects = sources.projects.len(),
            partners = sources.partners.len(),
            keywords = sources.keywords.len(),
            countries = self.reference.countries.len(),
            nuts_centroids = self.reference.nuts.len(),
            "building fact table"
        );
        let projections = assemble(sources, &self.reference);
        merge(&projections, &sources.nuts_labels, &self.reference.nuts)
    }
}

// =============================================================================
// TESTS - end-to-end over in-memory source tables
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eav::{EavRow, EavTable, ProgrammeId, ProjectId, TermId};
    use crate::lookup::{Centroid, CountryCentroids, NutsCentroids};
    use crate::source::{PartnerRow, ProgrammeRow, ProgrammeTypeRow, ProjectRow, SotoipRow};

    fn reference() -> ReferenceData {
        ReferenceData {
            countries: [
                ("IT".to_string(), Centroid { lat: 42.83, lng: 12.83 }),
                ("GB".to_string(), Centroid { lat: 54.0, lng: -2.0 }),
            ]
            .into_iter()
            .collect::<CountryCentroids>(),
            nuts: [
                ("IT", 42.5, 12.5),
                ("ITC", 45.0, 8.0),
                ("ITC4", 45.6, 9.7),
                ("ITC4C", 45.46, 9.19),
            ]
            .into_iter()
            .map(|(c, lat, lng)| (c.to_string(), Centroid { lat, lng }))
            .collect::<NutsCentroids>(),
        }
    }

    /// Statistics programme 1 with project 100 (budget 1000, two thematics,
    /// one partner with all four NUTS levels)
    fn sources() -> SourceTables {
        SourceTables {
            programmes: vec![ProgrammeRow {
                id: Some(1),
                programme_type: Some("ETC".to_string()),
                title: Some("Alpine Space".to_string()),
                use_for_statistics: Some(true),
            }],
            projects: vec![ProjectRow {
                pid: Some(100),
                programme_id: Some(1),
                budget: Some(1000.0),
                project_start: Some(1_420_070_400),
                project_end: Some(1_514_678_400),
            }],
            programme_types: vec![ProgrammeTypeRow {
                programme_type: Some("ETC".to_string()),
                period: Some("2014-2020".to_string()),
            }],
            partners: vec![PartnerRow {
                pid: Some(7),
                project_id: Some(100),
                partnership_type: Some(1),
                country: Some("Italy".to_string()),
                region_0: Some("IT".to_string()),
                region_1: Some("ITC".to_string()),
                region_2: Some("ITC4".to_string()),
                region_3: Some("ITC4C".to_string()),
                is_ext_nuts: Some(0),
                geocoding_x: Some(9.19),
                geocoding_y: Some(45.46),
            }],
            sotoip: vec![SotoipRow {
                programme_id: Some(1),
                thematic_objective: Some("(1)Research and innovation".to_string()),
                investment_priority: Some("(1b Business investment in R&I".to_string()),
            }],
            terms: [
                (TermId(10), "Transnational".to_string()),
                (TermId(20), "Energy".to_string()),
                (TermId(21), "Transport".to_string()),
            ]
            .into_iter()
            .collect(),
            strand: EavTable::new(vec![
                EavRow::new("keep_programme", 1, 500),
                EavRow::new("taxonomy_term", 10, 500),
            ]),
            source: EavTable::new(vec![
                EavRow::new("keep_programme", 1, 600),
                EavRow::new("taxonomy_term", 10, 600),
            ]),
            keywords: EavTable::new(vec![
                EavRow::new("kamut_project", 100, 20),
                EavRow::new("kamut_project", 100, 21),
            ]),
            nuts_labels: [("IT", "ITALIA"), ("ITC", "NORD-OVEST"), ("ITC4", "LOMBARDIA")]
                .into_iter()
                .map(|(c, d)| (c.to_string(), d.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_one_row_per_thematic() {
        let table = Pipeline::new(reference()).build(&sources());

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].thematic.as_deref(), Some("Energy"));
        assert_eq!(table.rows[1].thematic.as_deref(), Some("Transport"));
        // each (project, thematic, period) group carries the budget once
        assert_eq!(table.rows[0].budget, Some(1000.0));
        assert_eq!(table.rows[1].budget, Some(1000.0));
    }

    #[test]
    fn test_partner_fan_out_zeroes_repeated_budget() {
        let mut s = sources();
        let mut second = s.partners[0].clone();
        second.pid = Some(8);
        second.partnership_type = Some(0);
        s.partners.push(second);
        let table = Pipeline::new(reference()).build(&s);

        let rows: Vec<(Option<&str>, Option<i64>, Option<f64>)> = table
            .rows
            .iter()
            .map(|r| (r.thematic.as_deref(), r.partner_id, r.budget))
            .collect();
        assert_eq!(
            rows,
            vec![
                (Some("Energy"), Some(7), Some(1000.0)),
                (Some("Energy"), Some(8), Some(0.0)),
                (Some("Transport"), Some(7), Some(1000.0)),
                (Some("Transport"), Some(8), Some(0.0)),
            ]
        );
    }

    #[test]
    fn test_single_thematic_project_counts_budget_once() {
        let mut s = sources();
        s.keywords = EavTable::new(vec![EavRow::new("kamut_project", 100, 20)]);
        let mut second = s.partners[0].clone();
        second.pid = Some(8);
        s.partners.push(second);
        let table = Pipeline::new(reference()).build(&s);

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.budget_total(), 1000.0);
    }

    #[test]
    fn test_rows_share_partner_and_nuts_enrichment() {
        let table = Pipeline::new(reference()).build(&sources());
        let (a, b) = (&table.rows[0], &table.rows[1]);

        for row in [a, b] {
            assert_eq!(row.project_id, ProjectId(100));
            assert_eq!(row.partner_id, Some(7));
            assert_eq!(row.nuts_0.as_deref(), Some("[IT] - Italia"));
            assert_eq!(row.nuts_2.as_deref(), Some("[ITC4] - Lombardia"));
            assert_eq!(row.nuts_3.as_deref(), Some("ITC4C"));
            assert_eq!(row.cca2.as_deref(), Some("IT"));
            assert_eq!(row.lat, Some(42.83));
            assert_eq!(row.nuts3_lat, Some(45.46));
        }
        assert_eq!(FactRowEnrichment::of(a), FactRowEnrichment::of(b));
    }

    #[test]
    fn test_programme_attributes_fanned_out() {
        let table = Pipeline::new(reference()).build(&sources());
        let row = &table.rows[0];

        assert_eq!(row.programme_id, Some(ProgrammeId(1)));
        assert_eq!(row.programme_name.as_deref(), Some("Alpine Space"));
        assert_eq!(row.program_type.as_deref(), Some("Transnational"));
        assert_eq!(row.period.as_deref(), Some("2014-2020"));
        assert_eq!(row.thematic_objective.as_deref(), Some("(01)Research and innovation"));
        assert_eq!(
            row.investment_priority.as_deref(),
            Some("(01)b Business investment in R&I")
        );
        assert_eq!(row.project_start, Some(1_420_070_400.0));
        assert_eq!(row.project_end, Some(1_514_678_400.0));
    }

    #[test]
    fn test_code_width_from_final_rows() {
        let table = Pipeline::new(reference()).build(&sources());
        assert_eq!(
            table.code_width(),
            "(01)b Business investment in R&I".chars().count()
        );
    }

    #[test]
    fn test_rerun_is_identical() {
        let pipeline = Pipeline::new(reference());
        let baseline = pipeline.build(&sources());
        for _ in 0..5 {
            let again = pipeline.build(&sources());
            assert_eq!(baseline, again);
            assert_eq!(baseline.fingerprint().unwrap(), again.fingerprint().unwrap());
        }
    }

    #[test]
    fn test_malformed_objective_is_null_not_error() {
        let mut s = sources();
        s.sotoip[0].thematic_objective = Some("Research without a number".to_string());
        let table = Pipeline::new(reference()).build(&s);

        assert_eq!(table.rows.len(), 2);
        assert_eq!(table.rows[0].thematic_objective, None);
        assert!(table.rows[0].investment_priority.is_some());
    }

    #[test]
    fn test_uk_partner_resolves_like_gb() {
        let mut s = sources();
        s.partners[0].region_0 = Some("UK".to_string());
        let table = Pipeline::new(reference()).build(&s);

        assert_eq!(table.rows[0].cca2.as_deref(), Some("GB"));
        assert_eq!(table.rows[0].lat, Some(54.0));
        // no NUTS description for UK
        assert_eq!(table.rows[0].nuts_0, None);
    }

    #[test]
    fn test_project_without_attributes_still_present() {
        let mut s = sources();
        s.projects.push(ProjectRow {
            pid: Some(200),
            programme_id: None,
            budget: None,
            project_start: Some(0),
            project_end: Some(0),
        });
        let table = Pipeline::new(reference()).build(&s);

        let orphan: Vec<_> = table
            .rows
            .iter()
            .filter(|r| r.project_id == ProjectId(200))
            .collect();
        assert_eq!(orphan.len(), 1);
        assert_eq!(orphan[0].budget, None);
        assert_eq!(orphan[0].project_start, None);
        assert_eq!(orphan[0].programme_id, None);
    }

    /// Partner and NUTS columns of a row
    #[derive(Debug, PartialEq)]
    struct FactRowEnrichment {
        values: Vec<Option<String>>,
        coords: Vec<Option<f64>>,
    }

    impl FactRowEnrichment {
        fn of(row: &crate::merge::FactRow) -> Self {
            Self {
                values: vec![
                    row.country_name.clone(),
                    row.nuts_0.clone(),
                    row.nuts_1.clone(),
                    row.nuts_2.clone(),
                    row.nuts_3.clone(),
                    row.cca2.clone(),
                ],
                coords: vec![
                    row.partner_lat,
                    row.partner_lgt,
                    row.lat,
                    row.lng,
                    row.nuts0_lat,
                    row.nuts1_lat,
                    row.nuts2_lat,
                    row.nuts3_lat,
                ],
            }
        }
    }
}
