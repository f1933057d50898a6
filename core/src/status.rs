use crate::model::{AnnotationRecord, DerivedStatus, FactRecord, PortState, RiskLevel};

/// Classifies a tuple from its fact and annotation. Rules, first match wins:
///
/// 1. no fact: `unknown`
/// 2. active, annotation marked trusted: `healthy`
/// 3. active, no annotation: `suspicious`
/// 4. active, annotation marked suspicious: `suspicious`
/// 5. active, any other annotation: `healthy`
/// 6. disappeared: `ghost`
pub fn derive_status(fact: Option<&FactRecord>, annotation: Option<&AnnotationRecord>) -> DerivedStatus {
    let Some(fact) = fact else {
        return DerivedStatus::Unknown;
    };
    match (fact.state, annotation.map(|a| a.risk_level)) {
        (PortState::Active, Some(RiskLevel::Trusted)) => DerivedStatus::Healthy,
        (PortState::Active, None) => DerivedStatus::Suspicious,
        (PortState::Active, Some(RiskLevel::Suspicious)) => DerivedStatus::Suspicious,
        (PortState::Active, Some(_)) => DerivedStatus::Healthy,
        (PortState::Disappeared, _) => DerivedStatus::Ghost,
    }
}
