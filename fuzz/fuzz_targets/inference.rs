#![no_main]

use libfuzzer_sys::fuzz_target;
use vmscope::prelude::*;

// The first four bytes are the entry key, the rest is the blob. Export 1 starts right
// after the key, export 2 in the middle of the blob so calls between them resolve.
fuzz_target!(|data: &[u8]| {
    if data.len() < 6 {
        return;
    }
    let key = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let Ok(table) = OpcodeTableBuilder::sequential().build() else {
        return;
    };

    let signature = ExportSignature {
        flags: 0,
        parameter_types: Vec::new(),
        return_type: 0,
    };
    let middle = (data.len() / 2) as u64;
    let exports: ExportTable = [
        ExportInfo::new(1, 4, key, signature.clone()),
        ExportInfo::new(2, middle, key.rotate_left(7), signature),
    ]
    .into_iter()
    .collect();

    let image = VmImage::new(
        BytecodeBlob::from_mem(data.to_vec()),
        table,
        exports,
        ReferenceTable::new(),
    );
    let config = InferenceConfig::default().with_max_iterations(10_000);
    let _ = Devirtualizer::new(image, config).run();
});
