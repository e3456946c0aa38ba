//! End-to-end assessment scenarios

use assess_core::claims::ClaimKind;
use assess_core::evidence::{
    read_log, EvidenceBody, EvidenceSource, FlowEncryption, FlowObservation, JsonLinesLog,
    MemoryLog, ServiceScan, VulnerabilityScan,
};
use assess_core::ingest::{parse_evidence_lines, AddressHint, Disposition, IngestResult};
use assess_core::matcher::ReviewReason;
use assess_core::model::{
    AppProtocol, ConnectionId, Endpoint, ModelBuilder, NodeId, NodeKind, Protocol,
    SoftwareComponent, TlsVersion, Transport,
};
use assess_core::{
    Assessment, AssessmentConfig, ClaimId, ConflictPolicy, CoreError, ElementId, EvidenceRecord,
    ModelGraph, Severity, Verdict, VerdictState,
};
use std::sync::Arc;

const DEVICE: &str = "192.168.1.10";
const BACKEND: &str = "203.0.113.5";
const PHONE: &str = "192.168.1.20";

struct Home {
    model: ModelGraph,
    device: NodeId,
    phone: NodeId,
    conn: ConnectionId,
    encryption: ClaimId,
    unauthorized: ClaimId,
    vulnerabilities: ClaimId,
}

fn home() -> Home {
    let mut b = ModelBuilder::new("home");
    let device = b.add_node("device", NodeKind::Device).unwrap();
    let backend = b.add_node("backend", NodeKind::Backend).unwrap();
    let phone = b.add_node("phone", NodeKind::Mobile).unwrap();
    b.add_address_str(device, DEVICE).unwrap();
    b.add_address_str(backend, BACKEND).unwrap();
    b.add_address_str(phone, PHONE).unwrap();
    b.add_software(device, SoftwareComponent::new("openssl", Some("3.0.8")))
        .unwrap();
    let conn = b.add_connection(device, backend, Protocol::tls(443)).unwrap();
    let encryption = b
        .add_claim(
            ClaimKind::RequiresEncryption {
                min_version: Some(TlsVersion::Tls12),
            },
            conn,
        )
        .unwrap();
    let unauthorized = b
        .add_claim(ClaimKind::NoUnauthorizedFlow, ElementId::System)
        .unwrap();
    let vulnerabilities = b
        .add_claim(
            ClaimKind::NoKnownVulnerabilities {
                max_severity: Severity::Medium,
            },
            device,
        )
        .unwrap();
    Home {
        model: b.build().unwrap(),
        device: device.id(),
        phone: phone.id(),
        conn: conn.id(),
        encryption,
        unauthorized,
        vulnerabilities,
    }
}

fn flow(file: &str, src: &str, sport: u16, dst: &str, encryption: FlowEncryption) -> EvidenceRecord {
    EvidenceRecord::new(
        EvidenceSource::new("pcap", file, ""),
        None,
        EvidenceBody::Flow(FlowObservation {
            source: Endpoint::new(src.parse().unwrap(), Some(sport)),
            destination: Endpoint::new(dst.parse().unwrap(), Some(443)),
            transport: Transport::Tcp,
            application: Some(AppProtocol::Tls),
            encryption,
        }),
    )
    .unwrap()
}

fn handshake(succeeded: bool, version: Option<TlsVersion>) -> FlowEncryption {
    FlowEncryption::Handshake {
        succeeded,
        version,
        failure: if succeeded {
            None
        } else {
            Some("handshake failure".to_string())
        },
    }
}

fn tls13(sport: u16) -> EvidenceRecord {
    flow("a.json", DEVICE, sport, BACKEND, handshake(true, Some(TlsVersion::Tls13)))
}

fn verdict_of(assessment: &Assessment, claim: ClaimId, element: ElementId) -> Verdict {
    assessment.pair(claim, element).unwrap().verdict()
}

#[test]
fn test_scenario_a_successful_handshake_passes() {
    let h = home();
    let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
    assessment.submit_evidence(tls13(40000)).unwrap();
    assert_eq!(
        verdict_of(&assessment, h.encryption, ElementId::Connection(h.conn)),
        Verdict::Pass
    );
}

#[test]
fn test_scenario_b_failed_handshake_fails() {
    let h = home();
    let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
    let record = flow("b.json", DEVICE, 40000, BACKEND, handshake(false, None));
    let fingerprint = record.fingerprint.clone();
    assessment.submit_evidence(record).unwrap();

    let pair = assessment
        .pair(h.encryption, ElementId::Connection(h.conn))
        .unwrap();
    assert_eq!(pair.verdict(), Verdict::Fail);
    assert!(pair.conflicts.is_empty());
    assert_eq!(pair.evidence.len(), 1);
    assert_eq!(pair.evidence[0].fingerprint, fingerprint);
}

#[test]
fn test_scenario_c_pass_then_plaintext_records_conflict() {
    let h = home();
    let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
    let pass = tls13(40000);
    let plain = flow("c.json", DEVICE, 40001, BACKEND, FlowEncryption::Plaintext);
    let (pass_fp, plain_fp) = (pass.fingerprint.clone(), plain.fingerprint.clone());
    assessment.submit_evidence(pass).unwrap();
    assessment.submit_evidence(plain).unwrap();

    let pair = assessment
        .pair(h.encryption, ElementId::Connection(h.conn))
        .unwrap();
    assert_eq!(pair.verdict(), Verdict::Fail);
    assert_eq!(pair.conflicts.len(), 1);
    let conflict = &pair.conflicts[0];
    assert_eq!(conflict.previous, Verdict::Pass);
    assert_eq!(conflict.supporting, vec![pass_fp]);
    assert_eq!(conflict.contradicting, vec![plain_fp]);
    let states: Vec<_> = pair.transitions.iter().map(|t| t.to).collect();
    assert_eq!(states, vec![VerdictState::Pass, VerdictState::Fail]);
}

#[test]
fn test_scenario_d_undeclared_pair_fails_system_claim() {
    let h = home();
    let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
    let record = flow("d.json", PHONE, 50000, DEVICE, FlowEncryption::Unknown);
    let result = assessment.submit_evidence(record).unwrap();
    assert!(matches!(
        result,
        IngestResult::Accepted {
            disposition: Disposition::Unmatched,
            ..
        }
    ));

    assert_eq!(
        verdict_of(&assessment, h.unauthorized, ElementId::System),
        Verdict::Fail
    );
    let unmatched = assessment.unmatched_evidence();
    assert_eq!(unmatched.len(), 1);
    assert_eq!(unmatched[0].reason, ReviewReason::NoDeclaredConnection);
    assert_eq!(assessment.system_verdict().verdict, Verdict::Fail);
    // The phone has no claims of its own
    let phone = assessment.verdict(ElementId::Node(h.phone)).unwrap();
    assert_eq!(phone.verdict, Verdict::Inconclusive);
}

#[test]
fn test_scenario_e_identical_directories_deduplicate() {
    let h = home();
    let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
    let content = format!(
        "{}\n{}\n",
        r#"{"kind":"service_scan","endpoint":{"address":"203.0.113.5","port":443}}"#,
        r#"{"kind":"service_scan","endpoint":{"address":"203.0.113.5","port":22}}"#
    );

    let mut reports = Vec::new();
    for label in ["nmap-01", "nmap-02"] {
        let source = EvidenceSource::new("nmap", &format!("/evidence/{}/scan.jsonl", label), label);
        let (records, rejected) = parse_evidence_lines(&content, &source);
        assert!(rejected.is_empty());
        reports.push(assessment.submit_batch(records, label).unwrap());
    }
    assert_eq!((reports[0].accepted, reports[0].duplicate), (2, 0));
    assert_eq!((reports[1].accepted, reports[1].duplicate), (0, 2));
    assert_eq!(assessment.store().len(), 2);
}

#[test]
fn test_idempotent_reingestion() {
    let h = home();
    let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
    let batch = || {
        vec![
            tls13(40000),
            flow("a.json", PHONE, 50000, DEVICE, FlowEncryption::Unknown),
        ]
    };
    assessment.submit_batch(batch(), "pcap").unwrap();
    let before = assessment.snapshot();
    let report = assessment.submit_batch(batch(), "pcap").unwrap();
    assert_eq!((report.accepted, report.duplicate), (0, 2));
    let after = assessment.snapshot();
    assert_eq!(before.pairs, after.pairs);
    assert_eq!(before.system.verdict, after.system.verdict);
    assert_eq!(before.unmatched, after.unmatched);
}

#[test]
fn test_monotonic_confirming_evidence_keeps_pass() {
    let h = home();
    let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
    for port in 40000..40010 {
        assessment.submit_evidence(tls13(port)).unwrap();
    }
    let pair = assessment
        .pair(h.encryption, ElementId::Connection(h.conn))
        .unwrap();
    assert_eq!(pair.verdict(), Verdict::Pass);
    assert_eq!(pair.transitions.len(), 1);
}

#[test]
fn test_override_pins_until_removed() {
    let h = home();
    let element = ElementId::Connection(h.conn);
    let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
    assessment
        .apply_override(h.encryption, element, Verdict::Pass, "legacy firmware, accepted risk")
        .unwrap();
    assessment
        .submit_evidence(flow("o.json", DEVICE, 40000, BACKEND, FlowEncryption::Plaintext))
        .unwrap();
    assert_eq!(verdict_of(&assessment, h.encryption, element), Verdict::Pass);
    assert_eq!(
        assessment.pair(h.encryption, element).unwrap().state,
        VerdictState::Overridden(Verdict::Pass)
    );

    assessment.remove_override(h.encryption, element).unwrap();
    assert_eq!(verdict_of(&assessment, h.encryption, element), Verdict::Fail);
}

#[test]
fn test_override_on_missing_pair() {
    let h = home();
    let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
    let result = assessment.apply_override(h.encryption, ElementId::System, Verdict::Pass, "x");
    assert!(matches!(result, Err(CoreError::UnknownPair { .. })));
}

#[test]
fn test_claim_inheritance_local_replaces_system() {
    let mut b = ModelBuilder::new("fleet");
    let device = b.add_node("device", NodeKind::Device).unwrap();
    let backend = b.add_node("backend", NodeKind::Backend).unwrap();
    let phone = b.add_node("phone", NodeKind::Mobile).unwrap();
    b.add_address_str(device, DEVICE).unwrap();
    b.add_address_str(backend, BACKEND).unwrap();
    b.add_address_str(phone, PHONE).unwrap();
    let c1 = b.add_connection(device, backend, Protocol::tls(443)).unwrap();
    let c2 = b.add_connection(phone, backend, Protocol::tls(443)).unwrap();
    let system = b
        .add_claim(
            ClaimKind::RequiresEncryption {
                min_version: Some(TlsVersion::Tls12),
            },
            ElementId::System,
        )
        .unwrap();
    let local = b
        .add_claim(
            ClaimKind::RequiresEncryption {
                min_version: Some(TlsVersion::Tls13),
            },
            c2,
        )
        .unwrap();
    let assessment = Assessment::new(b.build().unwrap(), AssessmentConfig::default()).unwrap();

    // TLS 1.2 on both connections: passes the inherited claim, fails the local one
    let tls12 = handshake(true, Some(TlsVersion::Tls12));
    assessment
        .submit_evidence(flow("i.json", DEVICE, 40000, BACKEND, tls12.clone()))
        .unwrap();
    assessment
        .submit_evidence(flow("i.json", PHONE, 40000, BACKEND, tls12))
        .unwrap();

    let on_c1 = assessment.pair(system, ElementId::Connection(c1.id())).unwrap();
    assert!(on_c1.inherited);
    assert_eq!(on_c1.verdict(), Verdict::Pass);
    assert!(assessment.pair(system, ElementId::Connection(c2.id())).is_err());
    assert_eq!(
        verdict_of(&assessment, local, ElementId::Connection(c2.id())),
        Verdict::Fail
    );
}

#[test]
fn test_vulnerability_claim_by_component() {
    let h = home();
    let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
    let scan = |findings: Vec<(&str, Severity)>| {
        EvidenceRecord::new(
            EvidenceSource::new("vulnerabilities", "openssl.json", ""),
            None,
            EvidenceBody::VulnerabilityScan(VulnerabilityScan {
                component: "OpenSSL".to_string(),
                version: Some("3.0.8".to_string()),
                address: None,
                findings: findings
                    .into_iter()
                    .map(|(id, severity)| assess_core::evidence::Vulnerability {
                        id: id.to_string(),
                        severity,
                        summary: String::new(),
                    })
                    .collect(),
            }),
        )
        .unwrap()
    };
    assessment
        .submit_evidence(scan(vec![("CVE-2023-0001", Severity::Low)]))
        .unwrap();
    let node = ElementId::Node(h.device);
    assert_eq!(verdict_of(&assessment, h.vulnerabilities, node), Verdict::Pass);
    assessment
        .submit_evidence(scan(vec![("CVE-2023-0286", Severity::High)]))
        .unwrap();
    assert_eq!(verdict_of(&assessment, h.vulnerabilities, node), Verdict::Fail);
}

#[test]
fn test_violation_before_pass_is_not_a_conflict() {
    for policy in [ConflictPolicy::ContradictionWins, ConflictPolicy::HoldInconclusive] {
        let mut b = ModelBuilder::new("gateway");
        let device = b.add_node("device", NodeKind::Device).unwrap();
        b.add_software(device, SoftwareComponent::new("openssl", None))
            .unwrap();
        b.add_software(device, SoftwareComponent::new("busybox", None))
            .unwrap();
        let claim = b
            .add_claim(
                ClaimKind::NoKnownVulnerabilities {
                    max_severity: Severity::Medium,
                },
                device,
            )
            .unwrap();
        let config = AssessmentConfig {
            conflict_policy: policy,
            ..Default::default()
        };
        let assessment = Assessment::new(b.build().unwrap(), config).unwrap();
        let scan = |component: &str, findings: Vec<(&str, Severity)>| {
            EvidenceRecord::new(
                EvidenceSource::new("vulnerabilities", "scan.json", ""),
                None,
                EvidenceBody::VulnerabilityScan(VulnerabilityScan {
                    component: component.to_string(),
                    version: None,
                    address: None,
                    findings: findings
                        .into_iter()
                        .map(|(id, severity)| assess_core::evidence::Vulnerability {
                            id: id.to_string(),
                            severity,
                            summary: String::new(),
                        })
                        .collect(),
                }),
            )
            .unwrap()
        };
        let node = ElementId::Node(device.id());

        // One clean component is not enough to pass
        assessment.submit_evidence(scan("openssl", vec![])).unwrap();
        assert_eq!(verdict_of(&assessment, claim, node), Verdict::Inconclusive);

        assessment
            .submit_evidence(scan("busybox", vec![("CVE-2022-48174", Severity::Critical)]))
            .unwrap();
        let pair = assessment.pair(claim, node).unwrap();
        assert_eq!(pair.verdict(), Verdict::Fail, "{:?}", policy);
        assert!(pair.conflicts.is_empty(), "{:?}", policy);
    }
}

#[test]
fn test_seeded_client_gets_inherited_services_pair() {
    let mut b = ModelBuilder::new("lab");
    let device = b.add_node("device", NodeKind::Device).unwrap();
    let backend = b.add_node("backend", NodeKind::Backend).unwrap();
    b.add_address_str(backend, "10.0.0.2").unwrap();
    b.add_connection(device, backend, Protocol::tls(443)).unwrap();
    let services = b
        .add_claim(ClaimKind::NoUnexpectedServices, ElementId::System)
        .unwrap();
    let assessment = Assessment::new(b.build().unwrap(), AssessmentConfig::default()).unwrap();
    let on_device = ElementId::Node(device.id());
    assert!(assessment.pair(services, on_device).is_err());

    let epoch = assessment.epoch();
    let hints = vec![AddressHint {
        address: "10.0.0.9".parse().unwrap(),
        node: "device".to_string(),
    }];
    assert_eq!(assessment.seed_addresses("nmap", &hints).unwrap(), 1);
    assert!(assessment.epoch() > epoch);
    let pair = assessment.pair(services, on_device).unwrap();
    assert!(pair.inherited);
    assert_eq!(pair.verdict(), Verdict::Inconclusive);

    assessment
        .submit_evidence(EvidenceRecord::new(
            EvidenceSource::new("nmap", "scan.json", ""),
            None,
            EvidenceBody::ServiceScan(ServiceScan {
                endpoint: Endpoint::new("10.0.0.9".parse().unwrap(), Some(23)),
                transport: Transport::Tcp,
                service: Some("telnet".to_string()),
            }),
        ).unwrap())
        .unwrap();
    assert_eq!(verdict_of(&assessment, services, on_device), Verdict::Fail);
    assert_eq!(assessment.system_verdict().verdict, Verdict::Fail);

    // Seeding the same address again adds nothing
    assert_eq!(assessment.seed_addresses("nmap", &hints).unwrap(), 0);
}

#[test]
fn test_hold_inconclusive_policy() {
    let h = home();
    let config = AssessmentConfig {
        conflict_policy: ConflictPolicy::HoldInconclusive,
        ..Default::default()
    };
    let assessment = Assessment::new(h.model, config).unwrap();
    assessment.submit_evidence(tls13(40000)).unwrap();
    assessment
        .submit_evidence(flow("h.json", DEVICE, 40001, BACKEND, FlowEncryption::Plaintext))
        .unwrap();
    let pair = assessment
        .pair(h.encryption, ElementId::Connection(h.conn))
        .unwrap();
    assert_eq!(pair.verdict(), Verdict::Inconclusive);
    assert_eq!(pair.conflicts.len(), 1);
}

#[test]
fn test_replay_from_memory_log() {
    let h = home();
    let log = Arc::new(MemoryLog::new());
    let assessment = Assessment::new(h.model.clone(), AssessmentConfig::default())
        .unwrap()
        .with_log(log.clone());
    assessment.submit_evidence(tls13(40000)).unwrap();
    assessment
        .submit_evidence(flow("r.json", PHONE, 50000, DEVICE, FlowEncryption::Unknown))
        .unwrap();
    assessment
        .apply_override(h.unauthorized, ElementId::System, Verdict::Pass, "guest phone")
        .unwrap();
    assessment.close().unwrap();

    let replayed = Assessment::replay(h.model, AssessmentConfig::default(), log.entries()).unwrap();
    assert!(replayed.is_closed());
    assert_eq!(replayed.pairs(), assessment.pairs());
    assert_eq!(
        replayed.system_verdict().verdict,
        assessment.system_verdict().verdict
    );
}

#[test]
fn test_replay_from_file_log() {
    let h = home();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("evidence.log");
    {
        let assessment = Assessment::new(h.model.clone(), AssessmentConfig::default())
            .unwrap()
            .with_log(Arc::new(JsonLinesLog::open(&path).unwrap()));
        assessment.submit_evidence(tls13(40000)).unwrap();
        assessment
            .submit_evidence(flow("f.json", DEVICE, 40001, BACKEND, FlowEncryption::Plaintext))
            .unwrap();
    }
    let entries = read_log(&path).unwrap();
    assert_eq!(entries.len(), 2);
    let replayed = Assessment::replay(h.model, AssessmentConfig::default(), entries).unwrap();
    let pair = replayed
        .pair(h.encryption, ElementId::Connection(h.conn))
        .unwrap();
    assert_eq!(pair.verdict(), Verdict::Fail);
    assert_eq!(pair.conflicts.len(), 1);
}

#[test]
fn test_concurrent_batches_accept_each_record_once() {
    let h = home();
    let assessment = Arc::new(Assessment::new(h.model, AssessmentConfig::default()).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let assessment = assessment.clone();
            std::thread::spawn(move || {
                let records = (40000..40050).map(tls13).collect();
                assessment.submit_batch(records, &format!("pcap-{}", i)).unwrap()
            })
        })
        .collect();
    let accepted: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap().accepted)
        .sum();
    assert_eq!(accepted, 50);
    assert_eq!(assessment.store().len(), 50);
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn verdict() -> impl Strategy<Value = Verdict> {
        prop_oneof![
            Just(Verdict::Pass),
            Just(Verdict::Fail),
            Just(Verdict::Inconclusive)
        ]
    }

    /// Hub node with one claimed connection per spoke
    fn star(spokes: usize) -> (ModelGraph, NodeId, Vec<(ClaimId, ConnectionId)>) {
        let mut b = ModelBuilder::new("star");
        let hub = b.add_node("hub", NodeKind::Backend).unwrap();
        let mut pairs = Vec::new();
        for i in 0..spokes {
            let spoke = b.add_node(&format!("spoke-{}", i), NodeKind::Device).unwrap();
            let conn = b.add_connection(spoke, hub, Protocol::tls(443)).unwrap();
            let claim = b
                .add_claim(ClaimKind::RequiresEncryption { min_version: None }, conn)
                .unwrap();
            pairs.push((claim, conn.id()));
        }
        (b.build().unwrap(), hub.id(), pairs)
    }

    proptest! {
        #[test]
        fn test_weakest_link(verdicts in proptest::collection::vec(verdict(), 1..8)) {
            let (model, hub, pairs) = star(verdicts.len());
            let assessment = Assessment::new(model, AssessmentConfig::default()).unwrap();
            for ((claim, conn), v) in pairs.iter().zip(&verdicts) {
                assessment
                    .apply_override(*claim, ElementId::Connection(*conn), *v, "fixture")
                    .unwrap();
            }
            let expected = if verdicts.contains(&Verdict::Fail) {
                Verdict::Fail
            } else if verdicts.contains(&Verdict::Inconclusive) {
                Verdict::Inconclusive
            } else {
                Verdict::Pass
            };
            prop_assert_eq!(assessment.verdict(ElementId::Node(hub)).unwrap().verdict, expected);
            prop_assert_eq!(assessment.system_verdict().verdict, expected);
        }

        #[test]
        fn test_fail_is_never_cleared(outcomes in proptest::collection::vec(0u8..3, 1..20)) {
            let h = home();
            let assessment = Assessment::new(h.model, AssessmentConfig::default()).unwrap();
            let element = ElementId::Connection(h.conn);
            let mut failed = false;
            for (i, outcome) in outcomes.iter().enumerate() {
                let port = 40000 + i as u16;
                let encryption = match outcome {
                    0 => handshake(true, Some(TlsVersion::Tls13)),
                    1 => handshake(false, None),
                    _ => FlowEncryption::Plaintext,
                };
                assessment
                    .submit_evidence(flow("p.json", DEVICE, port, BACKEND, encryption))
                    .unwrap();
                failed |= *outcome != 0;
                let verdict = verdict_of(&assessment, h.encryption, element);
                prop_assert_eq!(verdict == Verdict::Fail, failed);
            }
        }
    }
}
