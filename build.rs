/// Build flow:
///
/// 1. Without the `ibverbs` feature, nothing to do: the software provider
///    needs no system library.
/// 2. Otherwise, probe `libibverbs` with `pkg-config` and generate bindings.
fn main() {
    // Refuse to compile on non-64-bit platforms.
    if cfg!(not(target_pointer_width = "64")) {
        panic!("`rdmabridge` currently only supports 64-bit platforms");
    }

    #[cfg(feature = "ibverbs")]
    {
        println!("cargo:rerun-if-changed=src/bindings/verbs.h");
        let lib = pkg_config::Config::new()
            .statik(false)
            .probe("libibverbs")
            .expect("`libibverbs` not found by pkg-config");
        let include_dirs = lib
            .include_paths
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        gen_verb_bindings(include_dirs);
    }
}

/// C enums used as flag sets.
#[cfg(feature = "ibverbs")]
const BITFIELD_ENUMS: &[&str] = &[
    "ibv_access_flags",
    "ibv_qp_attr_mask",
    "ibv_send_flags",
    "ibv_wc_flags",
];

/// C enums whose values cross as plain integers.
#[cfg(feature = "ibverbs")]
const CONST_ENUMS: &[&str] = &[
    "ibv_atomic_cap",
    "ibv_mtu",
    "ibv_port_state",
    "ibv_qp_state",
    "ibv_qp_type",
    "ibv_wc_opcode",
    "ibv_wc_status",
    "ibv_wr_opcode",
];

/// Structs with anonymous unions, written out by hand in `sys.rs`.
#[cfg(feature = "ibverbs")]
const HAND_WRITTEN: &[&str] = &["ibv_send_wr", "ibv_wc"];

#[cfg(feature = "ibverbs")]
fn gen_verb_bindings(include_dirs: Vec<String>) {
    use std::env;
    use std::path::Path;

    let mut builder = bindgen::builder()
        .clang_args(include_dirs.iter().map(|p| format!("-I{}", p)))
        .header("src/bindings/verbs.h")
        .allowlist_function("ibv_.*")
        .allowlist_type("ibv_.*")
        .allowlist_type("verbs_.*")
        .opaque_type("pthread_.*")
        .derive_copy(true)
        .derive_debug(false)
        .derive_default(true)
        .layout_tests(false)
        .prepend_enum_name(false)
        .size_t_is_usize(true);
    for name in HAND_WRITTEN {
        builder = builder.blocklist_type(name);
    }
    for name in BITFIELD_ENUMS {
        builder = builder.bitfield_enum(name);
    }
    for name in CONST_ENUMS {
        builder = builder.constified_enum_module(name);
    }

    let out_dir = env::var_os("OUT_DIR").expect("OUT_DIR is set by cargo");
    builder
        .generate()
        .expect("failed to generate libibverbs bindings")
        .write_to_file(Path::new(&out_dir).join("verbs_bindings.rs"))
        .expect("failed to write libibverbs bindings");
}
