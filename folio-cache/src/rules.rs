//! Invalidation rules.
//!
//! A rule maps a mutation (entity tag plus kind) to the tags whose entries
//! must be marked stale after it succeeds. Rules are closed over an aggregate
//! dependency graph: if `admin-stats` is derived from `borrows`, every
//! mutation that changes `borrows` also invalidates `admin-stats`.
//!
//! Every mutation invalidates its entity's list tags, since filtered lists
//! that do not embed the record may now gain or lose it. The reconciler
//! spares the list entries it patched. The entity's own detail tag is written
//! or removed directly and is never part of the invalidation set.

use std::collections::{BTreeSet, HashMap, VecDeque};

use folio_core::{EntityTag, MutationKind, ValidationError};
use once_cell::sync::Lazy;

/// Invalidation rule for one mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationRule {
    pub entity: EntityTag,
    pub kind: MutationKind,
    /// Tags marked stale after success, closed over aggregate dependencies.
    pub invalidates: BTreeSet<EntityTag>,
    /// The data service records the acting user for this mutation.
    pub requires_actor: bool,
}

impl MutationRule {
    /// Tags the reconciler overwrites or removes wholesale.
    pub fn direct_tags(&self) -> BTreeSet<EntityTag> {
        BTreeSet::from([self.entity])
    }
}

/// Complete set of mutation rules.
#[derive(Debug, Clone, Default)]
pub struct InvalidationRules {
    rules: HashMap<(EntityTag, MutationKind), MutationRule>,
}

impl InvalidationRules {
    pub fn builder() -> RulesBuilder {
        RulesBuilder::default()
    }

    /// Rules for the library catalogue.
    pub fn library() -> &'static InvalidationRules {
        &LIBRARY_RULES
    }

    pub fn rule(&self, entity: EntityTag, kind: MutationKind) -> Option<&MutationRule> {
        self.rules.get(&(entity, kind))
    }

    pub fn is_known(&self, entity: EntityTag, kind: MutationKind) -> bool {
        self.rules.contains_key(&(entity, kind))
    }

    /// Every rule, sorted by entity then kind.
    pub fn iter(&self) -> impl Iterator<Item = &MutationRule> {
        let mut rules: Vec<&MutationRule> = self.rules.values().collect();
        rules.sort_by_key(|rule| (rule.entity, rule.kind));
        rules.into_iter()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

struct RuleDecl {
    entity: EntityTag,
    kind: MutationKind,
    invalidates: Vec<EntityTag>,
    requires_actor: bool,
}

/// Builder that closes rules over the dependency graph.
#[derive(Default)]
pub struct RulesBuilder {
    /// source tag -> tags derived from it
    dependents: HashMap<EntityTag, BTreeSet<EntityTag>>,
    decls: Vec<RuleDecl>,
}

impl RulesBuilder {
    /// Declare that `derived` is computed from each tag in `sources`.
    pub fn derives(mut self, derived: EntityTag, sources: &[EntityTag]) -> Self {
        for source in sources {
            self.dependents.entry(*source).or_default().insert(derived);
        }
        self
    }

    pub fn rule(self, entity: EntityTag, kind: MutationKind, invalidates: &[EntityTag]) -> Self {
        self.push(entity, kind, invalidates, false)
    }

    /// Rule for a mutation that records the acting user.
    pub fn rule_with_actor(
        self,
        entity: EntityTag,
        kind: MutationKind,
        invalidates: &[EntityTag],
    ) -> Self {
        self.push(entity, kind, invalidates, true)
    }

    fn push(
        mut self,
        entity: EntityTag,
        kind: MutationKind,
        invalidates: &[EntityTag],
        requires_actor: bool,
    ) -> Self {
        self.decls.push(RuleDecl {
            entity,
            kind,
            invalidates: invalidates.to_vec(),
            requires_actor,
        });
        self
    }

    /// Close every rule and check it never invalidates what it writes.
    pub fn build(self) -> Result<InvalidationRules, ValidationError> {
        let mut rules = HashMap::new();

        for decl in &self.decls {
            if !decl.entity.is_detail() {
                return Err(ValidationError::InvalidValue {
                    field: "entity".to_string(),
                    reason: format!("mutations target detail tags, got {}", decl.entity),
                });
            }

            if let Some(tag) = decl.invalidates.iter().find(|tag| **tag == decl.entity) {
                return Err(ValidationError::InvalidValue {
                    field: "invalidates".to_string(),
                    reason: format!(
                        "{} {} writes {} directly and must not invalidate it",
                        decl.entity, decl.kind, tag
                    ),
                });
            }

            let mut seed: BTreeSet<EntityTag> = decl.invalidates.iter().copied().collect();
            seed.extend(decl.entity.list_tags().iter().copied());

            let mut roots = seed.clone();
            roots.insert(decl.entity);
            let mut invalidates = seed;
            invalidates.extend(self.reachable(&roots));
            invalidates.remove(&decl.entity);

            let rule = MutationRule {
                entity: decl.entity,
                kind: decl.kind,
                invalidates,
                requires_actor: decl.requires_actor,
            };
            if rules.insert((decl.entity, decl.kind), rule).is_some() {
                return Err(ValidationError::InvalidValue {
                    field: "rule".to_string(),
                    reason: format!("duplicate rule for {} {}", decl.entity, decl.kind),
                });
            }
        }

        Ok(InvalidationRules { rules })
    }

    /// Every tag derived, directly or transitively, from `roots`.
    fn reachable(&self, roots: &BTreeSet<EntityTag>) -> BTreeSet<EntityTag> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<EntityTag> = roots.iter().copied().collect();
        while let Some(tag) = queue.pop_front() {
            for derived in self.dependents.get(&tag).into_iter().flatten() {
                if seen.insert(*derived) {
                    queue.push_back(*derived);
                }
            }
        }
        seen
    }
}

static LIBRARY_RULES: Lazy<InvalidationRules> =
    Lazy::new(|| library_rules().expect("library invalidation rules are consistent"));

fn library_rules() -> Result<InvalidationRules, ValidationError> {
    use EntityTag::*;
    use MutationKind::*;

    InvalidationRules::builder()
        .derives(AdminStats, &[Books, Borrows, Users, Fines, AccountRequests])
        .derives(Books, &[Reviews])
        .derives(Book, &[Reviews])
        // borrowing
        .rule(BorrowRecord, Create, &[Books, Book])
        .rule_with_actor(BorrowRecord, Update, &[Books, Book, Fines])
        .rule(BorrowRecord, Delete, &[Books, Book])
        // catalogue
        .rule_with_actor(Book, Create, &[])
        .rule_with_actor(Book, Update, &[Borrows])
        .rule_with_actor(Book, Delete, &[Borrows, Reviews])
        // accounts
        .rule_with_actor(User, Update, &[AccountRequests])
        .rule_with_actor(User, Delete, &[AccountRequests, Borrows, Fines])
        // reviews
        .rule(Review, Create, &[Book])
        .rule(Review, Update, &[Book])
        .rule(Review, Delete, &[Book])
        // fines
        .rule(Fine, Update, &[User])
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use EntityTag::*;
    use MutationKind::*;

    fn tags(list: &[EntityTag]) -> BTreeSet<EntityTag> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_library_rules_build() {
        if let Err(err) = library_rules() {
            panic!("library catalogue rejected: {err}");
        }
        let rules = InvalidationRules::library();
        assert_eq!(rules.len(), 12);
        assert!(rules.is_known(BorrowRecord, Create));
        assert!(!rules.is_known(AdminStats, Update));
        assert!(!rules.is_known(Fine, Delete));
    }

    #[test]
    fn test_borrow_create_invalidates_lists_and_stats() {
        let rule = InvalidationRules::library()
            .rule(BorrowRecord, Create)
            .unwrap();
        assert_eq!(rule.invalidates, tags(&[Books, Book, Borrows, AdminStats]));
        assert!(!rule.requires_actor);
    }

    #[test]
    fn test_approve_borrow_invalidates_borrow_lists_not_detail() {
        let rule = InvalidationRules::library()
            .rule(BorrowRecord, Update)
            .unwrap();
        assert_eq!(
            rule.invalidates,
            tags(&[Books, Book, Borrows, Fines, AdminStats])
        );
        assert!(!rule.invalidates.contains(&BorrowRecord));
        assert!(rule.requires_actor);
    }

    #[test]
    fn test_every_mutation_invalidates_own_lists() {
        for rule in InvalidationRules::library().iter() {
            for tag in rule.entity.list_tags() {
                assert!(
                    rule.invalidates.contains(tag),
                    "{} {} leaves {} fresh",
                    rule.entity,
                    rule.kind,
                    tag
                );
            }
        }
    }

    #[test]
    fn test_review_changes_reach_stats_transitively() {
        let rule = InvalidationRules::library().rule(Review, Create).unwrap();
        assert_eq!(
            rule.invalidates,
            tags(&[Book, Books, Reviews, AdminStats])
        );
    }

    #[test]
    fn test_direct_tags_never_invalidated() {
        for rule in InvalidationRules::library().iter() {
            for tag in rule.direct_tags() {
                assert!(
                    !rule.invalidates.contains(&tag),
                    "{} {} invalidates directly written {}",
                    rule.entity,
                    rule.kind,
                    tag
                );
            }
        }
    }

    #[test]
    fn test_rules_are_closed_over_dependencies() {
        // every list tag a mutation touches feeds admin-stats
        for rule in InvalidationRules::library().iter() {
            let touches_stats_source = rule
                .invalidates
                .iter()
                .chain(rule.direct_tags().iter())
                .any(|tag| matches!(tag, Books | Borrows | Users | Fines | AccountRequests));
            if touches_stats_source {
                assert!(
                    rule.invalidates.contains(&AdminStats),
                    "{} {} misses admin-stats",
                    rule.entity,
                    rule.kind
                );
            }
        }
    }

    #[test]
    fn test_builder_rejects_self_invalidation() {
        let err = InvalidationRules::builder()
            .rule(Book, Update, &[Book])
            .build()
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidValue { ref field, .. } if field == "invalidates"));
    }

    #[test]
    fn test_builder_rejects_duplicates_and_non_detail_targets() {
        assert!(InvalidationRules::builder()
            .rule(Book, Create, &[])
            .rule(Book, Create, &[])
            .build()
            .is_err());
        assert!(InvalidationRules::builder()
            .rule(Books, Create, &[])
            .build()
            .is_err());
    }
}
