use convtrack_core::config::{ConversationConfig, DeinterlaceField};
use convtrack_core::conversation::{
    Address, ConvKey, ConvOptions, ConversationId, ConversationTable, ConversationType, Element,
    LinkContext, PacketInfo, PortType, SearchOptions,
};

use std::net::Ipv4Addr;

use pnet::datalink::MacAddr;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ip(last: u8) -> Address {
    Address::Ipv4(Ipv4Addr::new(10, 0, 0, last))
}

fn mac(last: u8) -> Address {
    Address::Ether(MacAddr::new(0x02, 0, 0, 0, 0, last))
}

fn tcp(table: &mut ConversationTable, frame: u32, a: u8, pa: u32, b: u8, pb: u32) -> ConversationId {
    table.create_conversation(
        frame,
        &ip(a),
        &ip(b),
        ConversationType::Tcp,
        pa,
        pb,
        ConvOptions::none(),
    )
}

fn find_tcp(
    table: &mut ConversationTable,
    frame: u32,
    a: u8,
    pa: u32,
    b: u8,
    pb: u32,
) -> Option<ConversationId> {
    table.find_conversation(
        frame,
        &ip(a),
        &ip(b),
        ConversationType::Tcp,
        pa,
        pb,
        SearchOptions::none(),
    )
}

#[test]
fn setup_frame_bounds_lookup() {
    init();
    let mut table = ConversationTable::default();
    let id = tcp(&mut table, 10, 1, 1, 2, 80);
    assert_eq!(find_tcp(&mut table, 10, 1, 1, 2, 80), Some(id));
    assert_eq!(find_tcp(&mut table, 5, 1, 1, 2, 80), None);
}

#[test]
fn out_of_order_versions() {
    init();
    let mut table = ConversationTable::default();
    let later = tcp(&mut table, 10, 1, 1, 2, 80);
    let earlier = tcp(&mut table, 5, 1, 1, 2, 80);
    assert_eq!(find_tcp(&mut table, 7, 1, 1, 2, 80), Some(earlier));
    assert_eq!(find_tcp(&mut table, 10, 1, 1, 2, 80), Some(later));
    assert_eq!(table.chain(later), vec![earlier, later]);
}

#[test]
fn wildcard_address_upgrade() {
    init();
    let mut table = ConversationTable::default();
    let id = table.create_conversation(
        1,
        &ip(1),
        &Address::None,
        ConversationType::Tcp,
        5000,
        443,
        ConvOptions::NoAddr2,
    );
    assert_eq!(find_tcp(&mut table, 2, 1, 5000, 2, 443), Some(id));
    assert!(!table.conversation(id).options().contains(ConvOptions::NoAddr2));
    assert_eq!(table.conversation(id).key().addr2(), &ip(2));
    assert_eq!(find_tcp(&mut table, 3, 1, 5000, 2, 443), Some(id));
    assert_eq!(find_tcp(&mut table, 3, 1, 5000, 3, 443), None);
    // The record kept its identity and creation index.
    assert_eq!(id.index(), 0);
    assert_eq!(table.len(), 1);
}

#[test]
fn id_keys_include_kind() {
    init();
    let mut table = ConversationTable::default();
    let custom = ConversationType::Custom(0x40);
    let id = table.create_conversation_by_id(1, custom, 0xABCD);
    assert_eq!(table.find_conversation_by_id(1, custom, 0xABCD), Some(id));
    assert_eq!(
        table.find_conversation_by_id(1, ConversationType::Custom(0x41), 0xABCD),
        None
    );
    assert_eq!(table.find_conversation_by_id(1, custom, 0xABCE), None);
}

#[test]
fn deinterlacer_registration() {
    init();
    let mut table = ConversationTable::default();
    let first = table.register_link(1, &mac(0xa), &mac(0xb), ConversationType::EthIN, 2, 0, 0);
    assert_eq!(first.index(), 0);
    let again = table.register_link(1, &mac(0xa), &mac(0xb), ConversationType::EthIN, 2, 0, 0);
    assert_eq!(again.index(), first.index());
    let reversed = table.resolve_link(1, &mac(0xb), &mac(0xa), ConversationType::EthIN, 2, 0, 0);
    assert_eq!(reversed, Some(first));
}

#[test]
fn shapes_are_isolated() {
    init();
    let mut table = ConversationTable::default();
    // Same values, different layouts.
    let uint = ConvKey::new(vec![
        Element::Uint(80),
        Element::Endpoint(ConversationType::Tcp),
    ]);
    let port = ConvKey::new(vec![
        Element::Port(80),
        Element::Endpoint(ConversationType::Tcp),
    ]);
    let id = table.create_conversation_from_elements(1, uint.clone());
    assert_eq!(table.find_conversation_full(1, &uint), Some(id));
    assert_eq!(table.find_conversation_full(1, &port), None);
    assert_eq!(
        table.find_conversation_by_id(1, ConversationType::Tcp, 80),
        Some(id)
    );

    let port_id = table.create_conversation_from_elements(1, port.clone());
    assert_eq!(table.find_conversation_full(1, &port), Some(port_id));
    assert_eq!(table.find_conversation_full(1, &uint), Some(id));
    let shapes: Vec<(String, usize)> = table
        .shapes()
        .map(|(name, chains)| (name.to_string(), chains))
        .collect();
    assert!(shapes.contains(&("port,endpoint".to_string(), 1)));
    assert!(shapes.contains(&("uint,endpoint".to_string(), 1)));
}

#[test]
fn lookup_returns_latest_established() {
    init();
    let mut table = ConversationTable::default();
    let setups = [40, 10, 30, 20, 50, 10];
    let ids: Vec<ConversationId> = setups
        .iter()
        .map(|s| tcp(&mut table, *s, 1, 1000, 2, 80))
        .collect();

    let chain = table.chain(ids[0]);
    let frames: Vec<u32> = chain
        .iter()
        .map(|id| table.conversation(*id).setup_frame())
        .collect();
    assert_eq!(frames, vec![10, 10, 20, 30, 40, 50]);

    for t in (0..60).rev().chain(0..60) {
        let found = find_tcp(&mut table, t, 1, 1000, 2, 80);
        let expected = setups.iter().copied().filter(|s| *s <= t).max();
        assert_eq!(
            found.map(|id| table.conversation(id).setup_frame()),
            expected,
            "frame {}",
            t
        );
    }
}

#[test]
fn direction_does_not_matter() {
    init();
    let mut table = ConversationTable::default();
    let id = tcp(&mut table, 1, 1, 33000, 2, 22);
    tcp(&mut table, 1, 3, 33000, 2, 22);
    for t in [1, 2, 100] {
        assert_eq!(find_tcp(&mut table, t, 1, 33000, 2, 22), Some(id));
        assert_eq!(find_tcp(&mut table, t, 2, 22, 1, 33000), Some(id));
    }
}

#[test]
fn upgrade_leaves_other_wildcards_alone() {
    init();
    let mut table = ConversationTable::default();
    let upgraded = table.create_conversation(
        1,
        &ip(1),
        &Address::None,
        ConversationType::Tcp,
        7000,
        21,
        ConvOptions::NoAddr2,
    );
    let untouched = table.create_conversation(
        1,
        &ip(1),
        &Address::None,
        ConversationType::Tcp,
        7001,
        21,
        ConvOptions::NoAddr2,
    );
    assert_eq!(find_tcp(&mut table, 2, 1, 7000, 2, 21), Some(upgraded));
    assert_eq!(find_tcp(&mut table, 3, 2, 21, 1, 7000), Some(upgraded));

    let wildcard = table.find_conversation(
        3,
        &ip(1),
        &Address::None,
        ConversationType::Tcp,
        7001,
        21,
        SearchOptions::NoAddrB,
    );
    assert_eq!(wildcard, Some(untouched));
    assert!(table
        .conversation(untouched)
        .options()
        .contains(ConvOptions::NoAddr2));
}

#[test]
fn templates_are_not_consumed() {
    init();
    let mut table = ConversationTable::default();
    let template = table.create_conversation(
        1,
        &ip(1),
        &Address::None,
        ConversationType::Tcp,
        5060,
        5060,
        ConvOptions::NoAddr2 | ConvOptions::Template,
    );
    let first = find_tcp(&mut table, 2, 1, 5060, 2, 5060).unwrap();
    let second = find_tcp(&mut table, 3, 1, 5060, 3, 5060).unwrap();
    assert_ne!(first, template);
    assert_ne!(second, template);
    assert_ne!(first, second);
    assert_eq!(find_tcp(&mut table, 4, 1, 5060, 2, 5060), Some(first));

    let wildcard = table.find_conversation(
        4,
        &ip(1),
        &Address::None,
        ConversationType::Tcp,
        5060,
        5060,
        SearchOptions::NoAddrB,
    );
    assert_eq!(wildcard, Some(template));
    assert!(table
        .conversation(template)
        .options()
        .contains(ConvOptions::Template));
}

#[test]
fn udp_templates_are_plain_wildcards() {
    init();
    let mut table = ConversationTable::default();
    let template = table.create_conversation(
        1,
        &ip(1),
        &Address::None,
        ConversationType::Udp,
        69,
        0,
        ConvOptions::NoAddr2 | ConvOptions::NoPort2 | ConvOptions::Template,
    );
    let found = table.find_conversation(
        2,
        &ip(1),
        &ip(2),
        ConversationType::Udp,
        69,
        1234,
        SearchOptions::none(),
    );
    assert_eq!(found, Some(template));
    assert_eq!(table.len(), 1);
}

#[test]
fn deinterlaced_packets_stay_on_their_link() {
    init();
    let config = ConversationConfig {
        deinterlacing_key: vec![DeinterlaceField::Vlan],
        ..Default::default()
    };
    let mut table = ConversationTable::new(&config);
    assert!(table.deinterlacing_enabled());

    let packet = |num: u32, vlan: u32| {
        PacketInfo::new(num)
            .with_addresses(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
            .with_ports(PortType::Tcp, 40000, 80)
            .with_link(LinkContext::new(mac(1), mac(2)).with_vlan(vlan))
    };

    let on_vlan10 = packet(1, 10);
    let link10 = table.register_link_for(&on_vlan10).unwrap();
    let conv10 = table.create_strat(&on_vlan10, ConversationType::Tcp, ConvOptions::none());
    assert_eq!(
        table.conversation(conv10).key().elements()[4],
        Element::Uint(link10.index())
    );

    let on_vlan20 = packet(2, 20);
    let link20 = table.register_link_for(&on_vlan20).unwrap();
    assert_ne!(link10, link20);
    assert_eq!(
        table.find_strat(&on_vlan20, ConversationType::Tcp, SearchOptions::none()),
        None
    );
    let conv20 = table.create_strat(&on_vlan20, ConversationType::Tcp, ConvOptions::none());
    assert_ne!(conv10, conv20);

    let reply10 = PacketInfo::new(3)
        .with_addresses(Ipv4Addr::new(10, 0, 0, 2), Ipv4Addr::new(10, 0, 0, 1))
        .with_ports(PortType::Tcp, 80, 40000)
        .with_link(LinkContext::new(mac(2), mac(1)).with_vlan(10));
    assert_eq!(
        table.find_conversation_pinfo_ro(&reply10, SearchOptions::none()),
        Some(conv10)
    );

    // Without link context the classic tables are used.
    let untagged = PacketInfo::new(4)
        .with_addresses(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2))
        .with_ports(PortType::Tcp, 40000, 80);
    assert_eq!(table.resolve_link_for(&untagged), None);
    assert_eq!(
        table.find_strat(&untagged, ConversationType::Tcp, SearchOptions::none()),
        None
    );
}

#[test]
fn deinterlacing_disabled_by_default() {
    init();
    let mut table = ConversationTable::default();
    let pinfo = PacketInfo::new(1).with_link(LinkContext::new(mac(1), mac(2)).with_interface(1));
    assert!(!table.deinterlacing_enabled());
    assert_eq!(table.register_link_for(&pinfo), None);
    assert_eq!(table.resolve_link_for(&pinfo), None);
}

#[test]
fn session_reset() {
    init();
    let mut table = ConversationTable::default();
    let before = tcp(&mut table, 1, 1, 1, 2, 2);
    table.reset();
    assert!(table.is_empty());
    assert_eq!(find_tcp(&mut table, 1, 1, 1, 2, 2), None);
    assert!(table.get(before).is_none());
    let after = tcp(&mut table, 1, 1, 1, 2, 2);
    assert_eq!(after.index(), 0);
    assert_eq!(find_tcp(&mut table, 1, 1, 1, 2, 2), Some(after));
}
