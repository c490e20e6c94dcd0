//! Typed projections over the generic Drupal field tables
//!
//! `field_data_field_strand`, `field_data_field_source` and
//! `field_data_field_keywords` share one physical shape:
//! `(entity_type, entity_id, field_<name>_tid)`. Which attribute a row
//! carries depends on both the table and the `entity_type` discriminator, so
//! each `(table, entity type)` pair gets its own typed projection instead of
//! inspecting rows by column name at runtime.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::marker::PhantomData;

use serde::Serialize;

macro_rules! surrogate_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }
    };
}

surrogate_id!(ProjectId);
surrogate_id!(ProgrammeId);
surrogate_id!(TermId);

/// An owner type that may appear in the `entity_type` column
pub trait EntityKind {
    const ENTITY_TYPE: &'static str;
    type Id: From<i64> + Copy + Eq + Hash + Ord;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ProjectEntity;
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgrammeEntity;
#[derive(Debug, Clone, Copy, Default)]
pub struct TermEntity;

impl EntityKind for ProjectEntity {
    const ENTITY_TYPE: &'static str = "kamut_project";
    type Id = ProjectId;
}

impl EntityKind for ProgrammeEntity {
    const ENTITY_TYPE: &'static str = "keep_programme";
    type Id = ProgrammeId;
}

impl EntityKind for TermEntity {
    const ENTITY_TYPE: &'static str = "taxonomy_term";
    type Id = TermId;
}

/// A physical field table and the column holding its attribute value
pub trait AttributeTable {
    const TABLE: &'static str;
    const VALUE_COLUMN: &'static str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Strand;
#[derive(Debug, Clone, Copy, Default)]
pub struct Source;
#[derive(Debug, Clone, Copy, Default)]
pub struct Keywords;

impl AttributeTable for Strand {
    const TABLE: &'static str = "field_data_field_strand";
    const VALUE_COLUMN: &'static str = "field_strand_tid";
}

impl AttributeTable for Source {
    const TABLE: &'static str = "field_data_field_source";
    const VALUE_COLUMN: &'static str = "field_source_tid";
}

impl AttributeTable for Keywords {
    const TABLE: &'static str = "field_data_field_keywords";
    const VALUE_COLUMN: &'static str = "field_keywords_tid";
}

/// One raw row of a field table
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct EavRow {
    pub entity_type: Option<String>,
    pub entity_id: Option<i64>,
    pub value: Option<i64>,
}

#[cfg(test)]
impl EavRow {
    pub fn new(entity_type: &str, entity_id: i64, value: i64) -> Self {
        Self {
            entity_type: Some(entity_type.to_string()),
            entity_id: Some(entity_id),
            value: Some(value),
        }
    }
}

/// Rows of one field table, tagged with the table they came from
#[derive(Debug, Clone)]
pub struct EavTable<A> {
    rows: Vec<EavRow>,
    _table: PhantomData<A>,
}

impl<A> Default for EavTable<A> {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl<A> EavTable<A> {
    pub fn new(rows: Vec<EavRow>) -> Self {
        Self {
            rows,
            _table: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}

impl<A: AttributeTable> EavTable<A> {
    /// `(entity_id, value)` for rows owned by `E`, in table order.
    /// Rows with a null id or value are dropped.
    pub fn project<E: EntityKind>(&self) -> Vec<(E::Id, TermId)> {
        self.rows
            .iter()
            .filter(|row| row.entity_type.as_deref() == Some(E::ENTITY_TYPE))
            .filter_map(|row| Some((<E::Id as From<i64>>::from(row.entity_id?), TermId(row.value?))))
            .collect()
    }

    /// Entity → term id, going through the table's own `taxonomy_term` rows.
    ///
    /// For the programme attributes the value stored on the owner row is a
    /// key that the `taxonomy_term` rows of the same table map back to a term
    /// id (`entity_id`). The two sub-projections are inner-joined on that key.
    pub fn resolve_terms<E: EntityKind>(&self) -> Vec<(E::Id, TermId)> {
        let mut tids_by_key: HashMap<TermId, Vec<TermId>> = HashMap::new();
        for (tid, key) in self.project::<TermEntity>() {
            tids_by_key.entry(key).or_default().push(tid);
        }

        self.project::<E>()
            .into_iter()
            .flat_map(|(owner, key)| {
                tids_by_key
                    .get(&key)
                    .into_iter()
                    .flatten()
                    .map(move |tid| (owner, *tid))
            })
            .collect()
    }
}

/// `taxonomy_term_data`: term id → name
#[derive(Debug, Default, Clone)]
pub struct TermDictionary {
    names: BTreeMap<TermId, String>,
}

impl TermDictionary {
    pub fn name(&self, tid: TermId) -> Option<&str> {
        self.names.get(&tid).map(String::as_str)
    }

    /// Inner join of `(owner, tid)` pairs against the dictionary
    pub fn label<K: Copy>(&self, pairs: &[(K, TermId)]) -> Vec<(K, String)> {
        pairs
            .iter()
            .filter_map(|(owner, tid)| Some((*owner, self.name(*tid)?.to_string())))
            .collect()
    }
}

impl FromIterator<(TermId, String)> for TermDictionary {
    fn from_iter<T: IntoIterator<Item = (TermId, String)>>(iter: T) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}

/// Programme → program type name.
///
/// A programme qualifies for a type only when the same term id is reached
/// through both its strand and its source attribute.
pub fn program_types(
    strand: &EavTable<Strand>,
    source: &EavTable<Source>,
    terms: &TermDictionary,
) -> Vec<(ProgrammeId, String)> {
    let strand_tids: HashSet<(ProgrammeId, TermId)> = strand
        .resolve_terms::<ProgrammeEntity>()
        .into_iter()
        .collect();

    let mut seen = HashSet::new();
    let both: Vec<(ProgrammeId, TermId)> = source
        .resolve_terms::<ProgrammeEntity>()
        .into_iter()
        .filter(|pair| strand_tids.contains(pair))
        .filter(|pair| seen.insert(*pair))
        .collect();

    terms.label(&both)
}
