//! Quantified arithmetic identities and the floating-point corner cases the
//! execution model must get bit-exact.

mod support;

use proptest::prelude::*;
use support::*;
use wasmite::{Interpreter, Value};

/// Module exporting the i32 operators used by the identities below, plus
/// f32/f64 min/max/compare and memory.grow/size.
fn numerics_module() -> Vec<u8> {
    let mut b = ModuleBuilder::new();
    let bin_i32 = b.add_type(&[I32, I32], &[I32]);
    let un_i32 = b.add_type(&[I32], &[I32]);
    let bin_f32 = b.add_type(&[F32, F32], &[F32]);
    let cmp_f32 = b.add_type(&[F32, F32], &[I32]);
    let bin_f64 = b.add_type(&[F64, F64], &[F64]);
    let un_f32 = b.add_type(&[F32], &[F32]);
    let producer = b.add_type(&[], &[I32]);
    b.add_memory(1, Some(3));

    for (name, opcode) in [
        ("add", 0x6Au8),
        ("and", 0x71),
        ("or", 0x72),
        ("shl", 0x74),
        ("shr_u", 0x76),
        ("rotl", 0x77),
        ("rotr", 0x78),
    ] {
        let f = b.add_func(bin_i32, &[], &body(&[local_get(0), local_get(1), vec![opcode]]));
        b.export_func(name, f);
    }
    let popcnt = b.add_func(un_i32, &[], &body(&[local_get(0), vec![0x69]]));
    b.export_func("popcnt", popcnt);

    for (name, opcode) in [("fmin", 0x96u8), ("fmax", 0x97)] {
        let f = b.add_func(bin_f32, &[], &body(&[local_get(0), local_get(1), vec![opcode]]));
        b.export_func(name, f);
    }
    for (name, opcode) in [("feq", 0x5Bu8), ("fne", 0x5C)] {
        let f = b.add_func(cmp_f32, &[], &body(&[local_get(0), local_get(1), vec![opcode]]));
        b.export_func(name, f);
    }
    for (name, opcode) in [("fmin64", 0xA4u8), ("fmax64", 0xA5)] {
        let f = b.add_func(bin_f64, &[], &body(&[local_get(0), local_get(1), vec![opcode]]));
        b.export_func(name, f);
    }
    let nearest = b.add_func(un_f32, &[], &body(&[local_get(0), vec![0x90]]));
    b.export_func("nearest", nearest);

    let grow = b.add_func(un_i32, &[], &body(&[local_get(0), vec![0x40, 0x00]]));
    b.export_func("grow", grow);
    let size = b.add_func(producer, &[], &body(&[vec![0x3F, 0x00]]));
    b.export_func("size", size);
    b.build()
}

fn load(bytes: &[u8]) -> Interpreter {
    let mut interp = Interpreter::new();
    interp.load(bytes).expect("module should load");
    interp
}

fn invoke_i32(interp: &mut Interpreter, name: &str, args: &[Value]) -> i32 {
    match interp.invoke(name, args).unwrap().as_slice() {
        [Value::I32(v)] => *v,
        other => panic!("expected one i32, got {other:?}"),
    }
}

fn invoke_f32_bits(interp: &mut Interpreter, name: &str, a: f32, b: f32) -> u32 {
    match interp
        .invoke(name, &[Value::from_f32(a), Value::from_f32(b)])
        .unwrap()
        .as_slice()
    {
        [Value::F32(bits)] => *bits,
        other => panic!("expected one f32, got {other:?}"),
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, ..ProptestConfig::default() })]

    #[test]
    fn add_is_commutative(a in any::<i32>(), b in any::<i32>()) {
        let mut interp = load(&numerics_module());
        let ab = invoke_i32(&mut interp, "add", &[Value::I32(a), Value::I32(b)]);
        let ba = invoke_i32(&mut interp, "add", &[Value::I32(b), Value::I32(a)]);
        prop_assert_eq!(ab, ba);
        prop_assert_eq!(ab, a.wrapping_add(b));
    }

    #[test]
    fn shift_round_trip_masks(a in any::<i32>(), k in 0u32..32) {
        let mut interp = load(&numerics_module());
        let shifted = invoke_i32(&mut interp, "shl", &[Value::I32(a), Value::I32(k as i32)]);
        let back = invoke_i32(&mut interp, "shr_u", &[Value::I32(shifted), Value::I32(k as i32)]);
        prop_assert_eq!(back as u32, (a as u32) & (u32::MAX >> k));
    }

    #[test]
    fn popcount_inclusion_exclusion(a in any::<i32>(), b in any::<i32>()) {
        let mut interp = load(&numerics_module());
        let or = invoke_i32(&mut interp, "or", &[Value::I32(a), Value::I32(b)]);
        let and = invoke_i32(&mut interp, "and", &[Value::I32(a), Value::I32(b)]);
        let p_or = invoke_i32(&mut interp, "popcnt", &[Value::I32(or)]);
        let p_and = invoke_i32(&mut interp, "popcnt", &[Value::I32(and)]);
        let p_a = invoke_i32(&mut interp, "popcnt", &[Value::I32(a)]);
        let p_b = invoke_i32(&mut interp, "popcnt", &[Value::I32(b)]);
        prop_assert_eq!(p_or + p_and, p_a + p_b);
    }

    #[test]
    fn rotates_compose_to_identity(a in any::<i32>(), k in 0i32..32) {
        let mut interp = load(&numerics_module());
        let left = invoke_i32(&mut interp, "rotl", &[Value::I32(a), Value::I32(k)]);
        let back = invoke_i32(&mut interp, "rotr", &[Value::I32(left), Value::I32(k)]);
        prop_assert_eq!(back, a);
    }

    #[test]
    fn invoke_is_deterministic(a in any::<i32>(), b in any::<i32>()) {
        let mut interp = load(&numerics_module());
        let first = interp.invoke("add", &[Value::I32(a), Value::I32(b)]).unwrap();
        let second = interp.invoke("add", &[Value::I32(a), Value::I32(b)]).unwrap();
        prop_assert_eq!(first, second);
    }
}

#[test]
fn float_min_max_nan_and_zero_rules() {
    let mut interp = load(&numerics_module());

    // NaN on either side yields a quiet NaN.
    let bits = invoke_f32_bits(&mut interp, "fmin", f32::NAN, 1.0);
    assert!(f32::from_bits(bits).is_nan());
    let bits = invoke_f32_bits(&mut interp, "fmax", 1.0, f32::NAN);
    assert!(f32::from_bits(bits).is_nan());

    // min(-0, +0) == -0 and max(-0, +0) == +0.
    let bits = invoke_f32_bits(&mut interp, "fmin", -0.0, 0.0);
    assert_eq!(bits, (-0.0f32).to_bits());
    let bits = invoke_f32_bits(&mut interp, "fmax", -0.0, 0.0);
    assert_eq!(bits, 0.0f32.to_bits());

    // Same rules for f64.
    let out = interp
        .invoke("fmin64", &[Value::from_f64(f64::NAN), Value::from_f64(2.0)])
        .unwrap();
    let [Value::F64(bits)] = out.as_slice() else { panic!("f64 expected") };
    assert!(f64::from_bits(*bits).is_nan());
}

#[test]
fn float_compare_nan_rules() {
    let mut interp = load(&numerics_module());
    let eq = interp
        .invoke(
            "feq",
            &[Value::from_f32(f32::NAN), Value::from_f32(f32::NAN)],
        )
        .unwrap();
    assert_eq!(eq, vec![Value::I32(0)]);
    let ne = interp
        .invoke(
            "fne",
            &[Value::from_f32(f32::NAN), Value::from_f32(f32::NAN)],
        )
        .unwrap();
    assert_eq!(ne, vec![Value::I32(1)]);
}

#[test]
fn nearest_rounds_ties_to_even() {
    let mut interp = load(&numerics_module());
    for (input, expected) in [(2.5f32, 2.0f32), (3.5, 4.0), (-2.5, -2.0), (0.5, 0.0)] {
        let out = interp
            .invoke("nearest", &[Value::from_f32(input)])
            .unwrap();
        assert_eq!(out, vec![Value::from_f32(expected)], "nearest({input})");
    }
}

#[test]
fn memory_grow_extends_by_whole_zero_pages() {
    let mut interp = load(&numerics_module());
    assert_eq!(invoke_i32(&mut interp, "size", &[]), 1);
    assert_eq!(interp.memory().unwrap().len(), 65536);

    assert_eq!(invoke_i32(&mut interp, "grow", &[Value::I32(1)]), 1);
    assert_eq!(invoke_i32(&mut interp, "size", &[]), 2);
    let mem = interp.memory().unwrap();
    assert_eq!(mem.len(), 2 * 65536);
    assert!(mem[65536..].iter().all(|&b| b == 0));

    // Past the declared maximum: -1, memory unchanged.
    assert_eq!(invoke_i32(&mut interp, "grow", &[Value::I32(5)]), -1);
    assert_eq!(interp.memory().unwrap().len(), 2 * 65536);

    // Negative delta: -1.
    assert_eq!(invoke_i32(&mut interp, "grow", &[Value::I32(-1)]), -1);
    assert_eq!(invoke_i32(&mut interp, "size", &[]), 2);
}

#[test]
fn saturating_truncation_to_u64() {
    let mut b = ModuleBuilder::new();
    let sat = b.add_type(&[F64], &[I64]);
    let f = b.add_func(sat, &[], &body(&[local_get(0), vec![0xFC, 0x07]])); // i64.trunc_sat_f64_u
    b.export_func("sat_u64", f);
    let mut interp = load(&b.build());

    let out = interp.invoke("sat_u64", &[Value::from_f64(-5.0)]).unwrap();
    assert_eq!(out, vec![Value::I64(0)]);
    let out = interp
        .invoke("sat_u64", &[Value::from_f64(f64::INFINITY)])
        .unwrap();
    assert_eq!(out, vec![Value::I64(u64::MAX as i64)]);
    let out = interp.invoke("sat_u64", &[Value::from_f64(f64::NAN)]).unwrap();
    assert_eq!(out, vec![Value::I64(0)]);
}

#[test]
fn sign_extension_opcodes() {
    let mut b = ModuleBuilder::new();
    let un_i32 = b.add_type(&[I32], &[I32]);
    let un_i64 = b.add_type(&[I64], &[I64]);
    let e8 = b.add_func(un_i32, &[], &body(&[local_get(0), vec![0xC0]]));
    b.export_func("extend8_32", e8);
    let e16 = b.add_func(un_i32, &[], &body(&[local_get(0), vec![0xC1]]));
    b.export_func("extend16_32", e16);
    let e32 = b.add_func(un_i64, &[], &body(&[local_get(0), vec![0xC4]]));
    b.export_func("extend32_64", e32);
    let mut interp = load(&b.build());

    assert_eq!(
        interp.invoke("extend8_32", &[Value::I32(0x80)]).unwrap(),
        vec![Value::I32(-128)]
    );
    assert_eq!(
        interp.invoke("extend16_32", &[Value::I32(0x8000)]).unwrap(),
        vec![Value::I32(-32768)]
    );
    assert_eq!(
        interp
            .invoke("extend32_64", &[Value::I64(0x8000_0000)])
            .unwrap(),
        vec![Value::I64(-2147483648)]
    );
}
