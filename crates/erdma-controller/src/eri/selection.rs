use std::collections::BTreeMap;

use api_types::Eri;
use error_stack::Report;
use tracing::info;

use super::ResolverError;
use crate::cloud::InstanceType;
use crate::cloud::NetworkInterface;

/// RDMA entitlement of an instance type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entitlement {
    pub card_count: i32,
    pub queue_pair_budget: i32,
}

impl Entitlement {
    /// `None` when the type has no RDMA interface quantity.
    pub fn from_instance_type(instance_type: &InstanceType) -> Option<Self> {
        let eri_quantity = instance_type.eri_quantity.filter(|q| *q > 0)?;
        let card_count = match instance_type.network_card_quantity {
            Some(cards) if cards >= 2 => cards.min(eri_quantity),
            _ => 1,
        };
        let per_card = instance_type.queue_pair_number.unwrap_or(0);
        // GPU instances get the queue pairs of every card
        let queue_pair_budget = if instance_type.gpu_amount.unwrap_or(0) > 0 {
            per_card * card_count
        } else {
            per_card
        };
        Some(Self {
            card_count,
            queue_pair_budget,
        })
    }
}

/// Interfaces kept from the existing set plus the card slots still to fill.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SelectionPlan {
    pub eris: Vec<Eri>,
    pub need_create: Vec<i32>,
    pub queue_pair_per_card: i32,
}

/// ERI for an existing interface. The interface's own queue pair count wins
/// over `preferred`.
pub(crate) fn to_eri(eni: &NetworkInterface, preferred: i32) -> Eri {
    let queue_pair = match eni.queue_pair_number {
        Some(qp) if qp > 0 => qp,
        _ => preferred,
    };
    Eri {
        id: eni.network_interface_id.clone(),
        is_primary_eni: eni.is_primary(),
        mac: eni.mac_address.clone(),
        instance_id: eni.instance_id.clone().unwrap_or_default(),
        card_index: eni.card_index(),
        queue_pair,
    }
}

/// Splits the instance's queue pair budget over its network cards, reusing
/// the RDMA interfaces it already has.
pub fn select_eri_from_exist(
    existing: &[NetworkInterface],
    queue_pair_budget: i32,
    card_count: i32,
    manage_non_owned: bool,
) -> Result<SelectionPlan, Report<ResolverError>> {
    let rdma: Vec<&NetworkInterface> = existing.iter().filter(|eni| eni.is_rdma()).collect();
    let existing_queue_pairs: i32 = rdma.iter().map(|eni| eni.queue_pairs()).sum();
    info!(
        existing = ?rdma.iter().map(|eni| eni.network_interface_id.as_str()).collect::<Vec<_>>(),
        existing_queue_pairs,
        queue_pair_budget,
        card_count,
        "selecting ERIs from existing interfaces"
    );

    let mut selected: Vec<&NetworkInterface> = Vec::new();
    let mut by_card: BTreeMap<i32, &NetworkInterface> = BTreeMap::new();
    for eni in rdma {
        if !(manage_non_owned || eni.created_by_controller()) {
            continue;
        }
        by_card.entry(eni.card_index()).or_insert_with(|| {
            selected.push(eni);
            eni
        });
    }

    let mut need_create: Vec<i32> = if existing_queue_pairs <= queue_pair_budget {
        (0..card_count).filter(|i| !by_card.contains_key(i)).collect()
    } else {
        Vec::new()
    };

    let mut per_card = 0;
    if !need_create.is_empty() {
        per_card = (queue_pair_budget - existing_queue_pairs) / need_create.len() as i32;
        if per_card > 0 {
            if !by_card.contains_key(&0) {
                // card 0 falls back to the primary interface
                if let Some(primary) = existing.iter().find(|eni| eni.is_primary()) {
                    selected.push(primary);
                    by_card.insert(0, primary);
                    need_create.retain(|i| *i != 0);
                }
            }
            if by_card.is_empty() {
                return Err(Report::new(ResolverError::NoAnchor));
            }
        } else {
            need_create.clear();
        }
    }

    let eris: Vec<Eri> = selected.iter().map(|eni| to_eri(eni, per_card)).collect();
    if eris.is_empty() && need_create.is_empty() {
        return Err(Report::new(ResolverError::NoAvailableSlot));
    }
    Ok(SelectionPlan {
        eris,
        need_create,
        queue_pair_per_card: per_card,
    })
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::cloud::Attachment;
    use crate::cloud::Tag;
    use crate::cloud::TagSet;
    use crate::cloud::TAG_CREATOR_KEY;
    use crate::cloud::TAG_CREATOR_VALUE;

    fn eni(id: &str, kind: &str, mode: &str, qp: Option<i32>, card: i32, mac: &str) -> NetworkInterface {
        NetworkInterface {
            network_interface_id: id.to_string(),
            interface_type: Some(kind.to_string()),
            mac_address: mac.to_string(),
            network_interface_traffic_mode: Some(mode.to_string()),
            queue_pair_number: qp,
            attachment: Some(Attachment {
                network_card_index: Some(card),
            }),
            ..Default::default()
        }
    }

    fn owned(mut eni: NetworkInterface) -> NetworkInterface {
        eni.tags = TagSet {
            tag: vec![Tag::new(TAG_CREATOR_KEY, TAG_CREATOR_VALUE)],
        };
        eni
    }

    fn eri(id: &str, primary: bool, card: i32, qp: i32, mac: &str) -> Eri {
        Eri {
            id: id.to_string(),
            is_primary_eni: primary,
            mac: mac.to_string(),
            instance_id: String::new(),
            card_index: card,
            queue_pair: qp,
        }
    }

    const MAC0: &str = "00:16:3e:00:00:00";
    const MAC1: &str = "00:16:3e:00:00:01";
    const RDMA: &str = "HighPerformance";
    const NORMAL: &str = "Normal";

    struct Case {
        name: &'static str,
        existing: Vec<NetworkInterface>,
        budget: i32,
        cards: i32,
        expected: Option<SelectionPlan>,
    }

    fn plan(eris: Vec<Eri>, need_create: Vec<i32>, per_card: i32) -> Option<SelectionPlan> {
        Some(SelectionPlan {
            eris,
            need_create,
            queue_pair_per_card: per_card,
        })
    }

    fn run(cases: Vec<Case>, manage_non_owned: bool) {
        for case in cases {
            let result =
                select_eri_from_exist(&case.existing, case.budget, case.cards, manage_non_owned);
            match case.expected {
                Some(expected) => {
                    let actual = result.unwrap_or_else(|e| panic!("{}: {e:?}", case.name));
                    assert_eq!(actual, expected, "{}", case.name);
                }
                None => assert!(result.is_err(), "{} should fail", case.name),
            }
        }
    }

    #[test]
    fn selection_with_non_owned_interfaces_managed() {
        run(
            vec![
                Case {
                    name: "nothing to anchor on",
                    existing: vec![],
                    budget: 8,
                    cards: 2,
                    expected: None,
                },
                Case {
                    name: "primary already RDMA with the whole budget",
                    existing: vec![eni("eni-1", "Primary", RDMA, Some(8), 0, MAC0)],
                    budget: 8,
                    cards: 1,
                    expected: plan(vec![eri("eni-1", true, 0, 8, MAC0)], vec![], 0),
                },
                Case {
                    name: "secondary RDMA interface holds the budget",
                    existing: vec![
                        eni("eni-1", "Primary", NORMAL, Some(0), 0, MAC0),
                        eni("eni-2", "Secondary", RDMA, Some(8), 0, MAC1),
                    ],
                    budget: 8,
                    cards: 1,
                    expected: plan(vec![eri("eni-2", false, 0, 8, MAC1)], vec![], 0),
                },
                Case {
                    name: "secondary on card 1 holds the budget",
                    existing: vec![
                        eni("eni-1", "Primary", NORMAL, Some(0), 0, MAC0),
                        eni("eni-2", "Secondary", RDMA, Some(8), 1, MAC1),
                    ],
                    budget: 8,
                    cards: 2,
                    expected: plan(vec![eri("eni-2", false, 1, 8, MAC1)], vec![], 0),
                },
                Case {
                    name: "RDMA primary on card 0, card 1 still to create",
                    existing: vec![eni("eni-primary", "Primary", RDMA, Some(6), 0, MAC0)],
                    budget: 8,
                    cards: 2,
                    expected: plan(vec![eri("eni-primary", true, 0, 6, MAC0)], vec![1], 2),
                },
                Case {
                    name: "secondaries on both cards",
                    existing: vec![
                        eni("eni-primary", "Primary", NORMAL, Some(0), 0, MAC0),
                        eni("eni-secondary1", "Secondary", RDMA, Some(6), 1, MAC0),
                        eni("eni-secondary2", "Secondary", RDMA, Some(2), 0, MAC1),
                    ],
                    budget: 8,
                    cards: 2,
                    expected: plan(
                        vec![
                            eri("eni-secondary1", false, 1, 6, MAC0),
                            eri("eni-secondary2", false, 0, 2, MAC1),
                        ],
                        vec![],
                        0,
                    ),
                },
                Case {
                    name: "two secondaries on card 0, first wins",
                    existing: vec![
                        eni("eni-primary", "Primary", NORMAL, Some(0), 0, MAC0),
                        eni("eni-secondary1", "Secondary", RDMA, Some(6), 0, MAC0),
                        eni("eni-secondary2", "Secondary", RDMA, Some(2), 0, MAC1),
                    ],
                    budget: 8,
                    cards: 2,
                    expected: plan(vec![eri("eni-secondary1", false, 0, 6, MAC0)], vec![], 0),
                },
                Case {
                    name: "remainder does not divide over the free cards",
                    existing: vec![
                        eni("eni-primary", "Primary", NORMAL, Some(0), 0, MAC0),
                        eni("eni-secondary1", "Secondary", RDMA, Some(6), 1, MAC0),
                        eni("eni-secondary2", "Secondary", RDMA, Some(2), 1, MAC1),
                    ],
                    budget: 9,
                    cards: 3,
                    expected: plan(vec![eri("eni-secondary1", false, 1, 6, MAC0)], vec![], 0),
                },
                Case {
                    name: "card 1 needs a new interface",
                    existing: vec![eni("eni-1", "Secondary", RDMA, Some(2), 0, MAC0)],
                    budget: 8,
                    cards: 2,
                    expected: plan(vec![eri("eni-1", false, 0, 2, MAC0)], vec![1], 6),
                },
                Case {
                    name: "card 0 converts the primary interface",
                    existing: vec![
                        eni("eni-1", "Secondary", RDMA, Some(2), 1, MAC0),
                        eni("eni-2", "Primary", NORMAL, None, 0, MAC1),
                    ],
                    budget: 8,
                    cards: 2,
                    expected: plan(
                        vec![
                            eri("eni-1", false, 1, 2, MAC0),
                            eri("eni-2", true, 0, 6, MAC1),
                        ],
                        vec![],
                        6,
                    ),
                },
            ],
            true,
        );
    }

    #[test]
    fn selection_with_only_owned_interfaces_managed() {
        run(
            vec![
                Case {
                    name: "nothing to anchor on",
                    existing: vec![],
                    budget: 8,
                    cards: 2,
                    expected: None,
                },
                Case {
                    name: "untagged RDMA primary uses the whole budget",
                    existing: vec![eni("eni-1", "Primary", RDMA, Some(8), 0, MAC0)],
                    budget: 8,
                    cards: 1,
                    expected: None,
                },
                Case {
                    name: "tagged secondary is kept",
                    existing: vec![
                        eni("eni-1", "Primary", NORMAL, Some(0), 0, MAC0),
                        owned(eni("eni-2", "Secondary", RDMA, Some(8), 0, MAC1)),
                    ],
                    budget: 8,
                    cards: 1,
                    expected: plan(vec![eri("eni-2", false, 0, 8, MAC1)], vec![], 0),
                },
                Case {
                    name: "untagged secondary uses the whole budget",
                    existing: vec![
                        eni("eni-1", "Primary", NORMAL, Some(0), 0, MAC0),
                        eni("eni-2", "Secondary", RDMA, Some(8), 0, MAC1),
                    ],
                    budget: 8,
                    cards: 1,
                    expected: None,
                },
                Case {
                    name: "untagged secondary leaves room for the primary",
                    existing: vec![
                        eni("eni-1", "Primary", NORMAL, Some(0), 0, MAC0),
                        eni("eni-2", "Secondary", RDMA, Some(4), 0, MAC1),
                    ],
                    budget: 8,
                    cards: 1,
                    expected: plan(vec![eri("eni-1", true, 0, 4, MAC0)], vec![], 4),
                },
            ],
            false,
        );
    }

    #[test]
    fn zero_interfaces_make_every_card_a_candidate_and_fail_anchor() {
        let err = select_eri_from_exist(&[], 16, 4, true).expect_err("no anchor");
        assert!(matches!(err.current_context(), ResolverError::NoAnchor));
    }

    #[test]
    fn all_cards_assigned_leaves_nothing_to_create() {
        let existing = vec![
            eni("eni-a", "Secondary", RDMA, Some(4), 0, MAC0),
            eni("eni-b", "Secondary", RDMA, Some(4), 1, MAC1),
        ];
        let plan = select_eri_from_exist(&existing, 8, 2, true).expect("should select");
        assert!(plan.need_create.is_empty());
        assert_eq!(plan.queue_pair_per_card, 0);
        let again = select_eri_from_exist(&existing, 8, 2, true).expect("should select");
        assert_eq!(plan, again);
    }

    #[test]
    fn entitlement_from_instance_type() {
        let mut ty = InstanceType {
            instance_type_id: "ecs.ebmgn8v".to_string(),
            eri_quantity: Some(2),
            network_card_quantity: Some(4),
            queue_pair_number: Some(8),
            gpu_amount: Some(8),
        };
        assert_eq!(
            Entitlement::from_instance_type(&ty),
            Some(Entitlement {
                card_count: 2,
                queue_pair_budget: 16
            })
        );

        ty.gpu_amount = None;
        ty.network_card_quantity = Some(1);
        assert_eq!(
            Entitlement::from_instance_type(&ty),
            Some(Entitlement {
                card_count: 1,
                queue_pair_budget: 8
            })
        );

        ty.eri_quantity = Some(0);
        assert_eq!(Entitlement::from_instance_type(&ty), None);
        ty.eri_quantity = None;
        assert_eq!(Entitlement::from_instance_type(&ty), None);
    }
}
