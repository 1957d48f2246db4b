//! Serialisation of recovered switch tables to the recompiler's TOML
//! configuration. Misses become comments so a partial scan still produces a
//! usable file, and a trailer records the overall tally.

use std::io::{self, Write};

use crate::switches::{SiteOutcome, SwitchTable};

pub fn write_config<W: Write>(w: &mut W, outcomes: &[SiteOutcome]) -> io::Result<()> {
    let total = outcomes.len();
    let mut errors = 0usize;

    writeln!(w, "# Auto-generated switch tables")?;
    writeln!(w, "# Found {total} switch table sites")?;
    writeln!(w)?;

    for outcome in outcomes {
        match outcome {
            SiteOutcome::Miss { bctr_addr, reason } => {
                writeln!(w, "# ERROR at bctr=0x{bctr_addr:08X}: {reason}")?;
                errors += 1;
            }
            SiteOutcome::Recovered(table) => write_switch(w, table)?,
        }
    }

    writeln!(
        w,
        "# Summary: {total} total, {} parsed, {errors} errors",
        total - errors
    )?;
    Ok(())
}

fn write_switch<W: Write>(w: &mut W, table: &SwitchTable) -> io::Result<()> {
    writeln!(w, "[[switch]]")?;
    writeln!(w, "base = 0x{:08X}", table.bctr_addr)?;
    writeln!(w, "r    = {}", table.index_reg)?;

    let labels: Vec<String> = table
        .labels
        .iter()
        .map(|label| format!("0x{label:08X}"))
        .collect();
    if labels.len() <= 8 {
        writeln!(w, "labels = [{}]", labels.join(", "))?;
    } else {
        writeln!(w, "labels = [")?;
        let rows: Vec<&[String]> = labels.chunks(8).collect();
        for (i, row) in rows.iter().enumerate() {
            let comma = if i + 1 < rows.len() { "," } else { "" };
            writeln!(w, "    {}{comma}", row.join(", "))?;
        }
        writeln!(w, "]")?;
    }

    writeln!(
        w,
        "# table=0x{:08X} base_ref=0x{:08X} type={} scale={} size={}",
        table.table_addr,
        table.base_addr,
        table.entry_width.name(),
        table.entry_scale,
        table.labels.len()
    )?;
    writeln!(w)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switches::EntryWidth;

    fn sample_table(labels: Vec<u32>) -> SwitchTable {
        SwitchTable {
            bctr_addr: 0x8210_0010,
            index_reg: 4,
            table_addr: 0x8200_0040,
            base_addr: 0x8210_0000,
            entry_width: EntryWidth::Byte,
            entry_scale: 4,
            labels,
        }
    }

    fn render(outcomes: &[SiteOutcome]) -> String {
        let mut buf = Vec::new();
        write_config(&mut buf, outcomes).unwrap();
        String::from_utf8(buf).unwrap()
    }

    #[test]
    fn short_label_lists_stay_on_one_line() {
        let labels = (0..8).map(|i| 0x8210_0000 + i * 4).collect();
        let out = render(&[SiteOutcome::Recovered(sample_table(labels))]);

        assert!(out.contains("[[switch]]\n"));
        assert!(out.contains("base = 0x82100010\n"));
        assert!(out.contains("r    = 4\n"));
        assert!(out.contains(
            "labels = [0x82100000, 0x82100004, 0x82100008, 0x8210000C, \
             0x82100010, 0x82100014, 0x82100018, 0x8210001C]\n"
        ));
        assert!(out.contains("# table=0x82000040 base_ref=0x82100000 type=u8 scale=4 size=8\n"));
        assert!(out.contains("# Summary: 1 total, 1 parsed, 0 errors\n"));
    }

    #[test]
    fn long_label_lists_wrap_in_rows_of_eight() {
        let labels: Vec<u32> = (0..10).map(|i| 0x8210_0000 + i * 4).collect();
        let out = render(&[SiteOutcome::Recovered(sample_table(labels))]);

        assert!(out.contains("labels = [\n"));
        // Eight entries with a trailing comma, then the final short row.
        assert!(out.contains(
            "    0x82100000, 0x82100004, 0x82100008, 0x8210000C, \
             0x82100010, 0x82100014, 0x82100018, 0x8210001C,\n"
        ));
        assert!(out.contains("    0x82100020, 0x82100024\n"));
        assert!(out.contains("]\n"));
        assert!(out.contains("size=10\n"));
    }

    #[test]
    fn misses_become_comments_and_count_as_errors() {
        let outcomes = [
            SiteOutcome::Miss {
                bctr_addr: 0x8212_3456,
                reason: "no table load before the base computation".into(),
            },
            SiteOutcome::Recovered(sample_table(vec![0x8210_0000])),
        ];
        let out = render(&outcomes);

        assert!(out.contains(
            "# ERROR at bctr=0x82123456: no table load before the base computation\n"
        ));
        assert!(out.contains("# Summary: 2 total, 1 parsed, 1 errors\n"));
    }
}
