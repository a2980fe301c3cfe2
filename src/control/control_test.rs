use super::*;

use stun::agent::TransactionId;

#[test]
fn test_tie_breaker_roundtrip() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(AttrControlling(4321)),
    ])?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut c = AttrControlling(0);
    c.get_from(&decoded)?;
    assert_eq!(c.0, 4321);

    // The message carries ICE-CONTROLLING, not ICE-CONTROLLED.
    let mut wrong = AttrControlled(0);
    assert!(wrong.get_from(&decoded).is_err());

    Ok(())
}

#[test]
fn test_attr_control_picks_attribute_by_role() -> Result<(), stun::Error> {
    for (role, attr) in [
        (Role::Controlling, ATTR_ICE_CONTROLLING),
        (Role::Controlled, ATTR_ICE_CONTROLLED),
    ] {
        let mut m = Message::new();
        m.build(&[
            Box::new(BINDING_REQUEST),
            Box::new(TransactionId::new()),
            Box::new(AttrControl {
                role,
                tie_breaker: 99,
            }),
        ])?;
        assert!(m.contains(attr), "wrong attribute for {}", role);

        let mut t = TieBreaker::default();
        t.get_from_as(&m, attr)?;
        assert_eq!(t.0, 99);
    }

    Ok(())
}

#[test]
fn test_use_candidate() -> Result<(), stun::Error> {
    let mut m = Message::new();
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(UseCandidateAttr::new()),
    ])?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;
    assert!(UseCandidateAttr::is_set(&decoded));

    let plain = Message::new();
    assert!(!UseCandidateAttr::is_set(&plain));

    Ok(())
}

#[test]
fn test_priority_roundtrip() -> Result<(), stun::Error> {
    let mut m = Message::new();
    let p = PriorityAttr(0x6e_0001_fe);
    m.build(&[
        Box::new(BINDING_REQUEST),
        Box::new(TransactionId::new()),
        Box::new(p),
    ])?;

    let mut decoded = Message::new();
    decoded.write(&m.raw)?;

    let mut got = PriorityAttr::default();
    got.get_from(&decoded)?;
    assert_eq!(got, p);

    let empty = Message::new();
    let mut missing = PriorityAttr::default();
    assert!(missing.get_from(&empty).is_err());

    Ok(())
}

#[test]
fn test_role_flip() {
    assert_eq!(Role::Controlling.flip(), Role::Controlled);
    assert_eq!(Role::Controlled.flip(), Role::Controlling);
    assert!(Role::Controlling.is_controlling());
    assert!(!Role::Controlled.is_controlling());
}
