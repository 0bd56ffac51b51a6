//! Print the indexed cell listing of a workbook's first sheet, as the model sees it.
//! Run: cargo run --bin dump_sheet -- path/to/form.xlsx

use formfill_lib::excel;

fn main() {
    let path = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: dump_sheet <form.xlsx>");
        std::process::exit(2);
    });
    let bytes = match std::fs::read(&path) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("Could not read {}: {}", path, e);
            std::process::exit(1);
        }
    };

    let layout = match excel::read_layout(&bytes) {
        Ok(l) => l,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    println!("Sheet: {}", layout.name);
    match layout.used_range {
        Some(range) => println!("Used range: {}", range),
        None => println!("Used range: (empty)"),
    }
    for merged in &layout.merged {
        println!("Merged: {}", merged);
    }

    match excel::index_sheet(&bytes) {
        Ok(cells) => {
            for cell in cells.iter().filter(|c| !c.text.is_empty()) {
                println!("{:>8}  {:?}", cell.address.to_string(), cell.text);
            }
            println!("{} cells indexed", cells.len());
        }
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
