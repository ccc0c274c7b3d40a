//! Rechunks a sequence of byte slices of arbitrary sizes into fixed-size output slices, copying
//! only the bytes that straddle an output boundary.

/// Repackages `input_fragments` into fixed-size chunks of `output_fragment_size` bytes, except
/// possibly the last, which is in `(0, output_fragment_size]`. Yields nothing for empty input.
///
/// Panics if `output_fragment_size` is zero.
pub fn refragment<'a, I>(input_fragments: I, output_fragment_size: usize) -> Vec<Vec<u8>>
where
    I: IntoIterator<Item = &'a [u8]>,
{
    assert!(output_fragment_size > 0, "output fragment size must be positive");

    let mut output = Vec::new();
    let mut carry: Vec<u8> = Vec::new();

    for mut frag in input_fragments {
        if !carry.is_empty() {
            let offset = (output_fragment_size - carry.len()).min(frag.len());
            carry.extend_from_slice(&frag[..offset]);
            frag = &frag[offset..];
            if carry.len() >= output_fragment_size {
                output.push(core::mem::take(&mut carry));
            }
        }

        let mut offset = 0;
        while offset < frag.len() {
            let end = (offset + output_fragment_size).min(frag.len());
            let chunk = &frag[offset..end];
            if chunk.len() < output_fragment_size {
                debug_assert!(carry.is_empty());
                carry.extend_from_slice(chunk);
            } else {
                output.push(chunk.to_vec());
            }
            offset = end;
        }
    }

    if !carry.is_empty() {
        output.push(carry);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owned(chunks: &[Vec<u8>]) -> Vec<Vec<u8>> {
        chunks.to_vec()
    }

    #[test]
    fn empty_input_yields_nothing() {
        let out = refragment(core::iter::empty(), 1000);
        assert!(out.is_empty());
        let out = refragment([b"".as_ref()], 1000);
        assert!(out.is_empty());
    }

    #[test]
    fn no_copy_when_aligned() {
        let out = refragment([b"012345".as_ref(), b"6789".as_ref()], 1000);
        assert_eq!(out, owned(&[b"0123456789".to_vec()]));
    }

    #[test]
    fn aligned_to_chunk_size() {
        let out = refragment([b"012345".as_ref(), b"6789".as_ref()], 6);
        assert_eq!(out, owned(&[b"012345".to_vec(), b"6789".to_vec()]));
    }

    #[test]
    fn straddling_boundary_requires_copy() {
        let out = refragment([b"0123456789".as_ref(), b"abcdef".as_ref()], 7);
        assert_eq!(
            out,
            owned(&[b"0123456".to_vec(), b"789abcd".to_vec(), b"ef".to_vec()])
        );
    }

    #[test]
    fn single_byte_chunks() {
        let out = refragment([b"012345".as_ref(), b"6789".as_ref(), b"".as_ref()], 1);
        let expected: Vec<Vec<u8>> = b"0123456789".iter().map(|b| vec![*b]).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn conservation_property() {
        let inputs: [&[u8]; 3] = [b"abc", b"", b"defgh"];
        let concatenated: Vec<u8> = inputs.iter().flat_map(|s| s.iter().copied()).collect();
        for size in 1..=concatenated.len() + 1 {
            let out = refragment(inputs, size);
            let rejoined: Vec<u8> = out.into_iter().flatten().collect();
            assert_eq!(rejoined, concatenated);
        }
    }

    #[test]
    #[should_panic]
    fn zero_size_panics() {
        let _ = refragment([b"x".as_ref()], 0);
    }
}
